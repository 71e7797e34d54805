// Over-the-air update cycle: refresh the display data, then the update
// index, then the newest enabled pack; enable whatever is usable and restart
// into a newer version once that is safe. Driven by `step()` every tick.

pub mod index;
pub mod telemetry;

pub use index::PackIndex;
pub use telemetry::Beacon;

use std::fs::File;
use std::io::Write;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::de::IgnoredAny;

use crate::boot::{BootChoice, SystemControl};
use crate::clock::SharedClock;
use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::http::{FetchError, FetchEvent, HttpFetcher, Validation};
use crate::network::{ConnectionState, NetworkLink, Radio, RadioError};
use crate::pack::{FetchSource, PackUnpacker, UnpackError, UnpackStatus};
use crate::storage::Storage;
use crate::version::FIRMWARE_VERSION;
use crate::versions::{select_latest_enabled, VersionStore};
use crate::ErrorClass;

pub const API_FILE: &str = "data/clock.json";
pub const API_TEMP_FILE: &str = "data/clock.json.new";
pub const INDEX_FILE: &str = "data/packs.json";
pub const INDEX_TEMP_FILE: &str = "data/packs.json.new";

/// Presentation layer hook, called after every data refresh attempt.
pub trait DefinitionLoader {
    fn load_definition(&mut self) -> Result<()>;
}

/// Everything outside the update core that the orchestrator calls into.
pub struct Collaborators {
    pub loader: Box<dyn DefinitionLoader>,
    pub diagnostics: Rc<dyn Diagnostics>,
    pub system: Box<dyn SystemControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Wait,
    JoinWifi,
    FetchApi,
    FetchIndex,
    FetchPack,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Wait => "wait",
            Step::JoinWifi => "join-wifi",
            Step::FetchApi => "fetch-data",
            Step::FetchIndex => "fetch-index",
            Step::FetchPack => "fetch-pack",
        }
    }
}

/// Read-only progress shown in the settings UI. Times are epoch millis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStatus {
    pub index_name: Option<String>,
    pub index_updated: Option<String>,
    pub api_fetched: Option<u64>,
    pub index_fetched: Option<u64>,
}

pub struct UpdateOrchestrator<R: Radio> {
    link: NetworkLink<R>,
    storage: Storage,
    store: VersionStore,
    settings: Settings,
    clock: SharedClock,
    collaborators: Collaborators,
    running_dir: String,
    running_num: u32,
    step: Step,
    next_check: u64,
    fetcher: Option<HttpFetcher>,
    output: Option<File>,
    unpacker: Option<PackUnpacker>,
    index: Option<PackIndex>,
    status: UpdateStatus,
}

impl<R: Radio> UpdateOrchestrator<R> {
    pub fn new(
        link: NetworkLink<R>,
        storage: Storage,
        settings: Settings,
        clock: SharedClock,
        running: Option<&BootChoice>,
        collaborators: Collaborators,
    ) -> Self {
        let initial_delay = settings.updater_initial_delay_ms;
        let mut updater = Self {
            link,
            store: VersionStore::new(storage.clone()),
            storage,
            settings,
            clock,
            collaborators,
            running_dir: running.map(|c| c.dir_name.clone()).unwrap_or_default(),
            running_num: running.map_or(0, |c| c.version.num),
            step: Step::Wait,
            next_check: 0,
            fetcher: None,
            output: None,
            unpacker: None,
            index: None,
            status: UpdateStatus::default(),
        };
        updater.retry_after(initial_delay);
        updater
    }

    pub fn current_step(&self) -> Step {
        self.step
    }

    pub fn status(&self) -> &UpdateStatus {
        &self.status
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn link(&self) -> &NetworkLink<R> {
        &self.link
    }

    /// Monotonic time of the next attempt while waiting.
    pub fn next_check(&self) -> u64 {
        self.next_check
    }

    /// Runs the current step once. Never fails: any error is logged and
    /// turned into a retry after the failure delay.
    pub fn step(&mut self) {
        let step = self.step;
        let result = match step {
            Step::Wait => self.wait_step(),
            Step::JoinWifi => self.join_wifi_step(),
            Step::FetchApi => self.fetch_api_step(),
            Step::FetchIndex => self.fetch_index_step(),
            Step::FetchPack => self.fetch_pack_step(),
        };
        if let Err(e) = result {
            warn!(
                "Software update {} step failed ({}): {:#}",
                step.as_str(),
                error_class(&e).as_str(),
                e
            );
            self.retry_after(self.settings.updater_failure_delay_ms);
        }
    }

    /// Abandons whatever is in flight and schedules the next attempt.
    pub fn retry_after(&mut self, delay_ms: u64) {
        self.link.close();
        self.fetcher = None;
        self.output = None;
        self.unpacker = None;
        self.next_check = self.clock.monotonic_millis() + delay_ms;
        self.step = Step::Wait;
        info!("Next software update attempt in {} ms", delay_ms);
    }

    fn wait_step(&mut self) -> Result<()> {
        if self.clock.monotonic_millis() >= self.next_check {
            self.step = Step::JoinWifi;
        }
        Ok(())
    }

    /// Fetching starts once the link has been ONLINE for the Wi-Fi delay;
    /// each fetcher opens its own connection from there.
    fn join_wifi_step(&mut self) -> Result<()> {
        self.link.poll();
        match self.link.state() {
            ConnectionState::Offline | ConnectionState::Joining => {
                if self.settings.has_wifi_credentials() {
                    self.link
                        .join(&self.settings.wifi_ssid, &self.settings.wifi_password);
                }
            }
            ConnectionState::Online => {
                if self.link.state_elapsed() > self.settings.updater_wifi_delay_ms {
                    self.start_api_fetch()?;
                }
            }
            ConnectionState::Connected => self.link.close(),
        }
        Ok(())
    }

    fn start_api_fetch(&mut self) -> Result<()> {
        if self.settings.api_url.is_empty() {
            info!("No API URL configured");
            return self.start_index_fetch();
        }
        let url = self.beacon().request_url(&self.settings.api_url);
        let etag = Some(self.settings.api_etag.as_str());
        match HttpFetcher::new(&url, etag, self.settings.silence_timeout_ms) {
            Ok(fetcher) => {
                self.output = Some(self.storage.create(API_TEMP_FILE)?);
                self.fetcher = Some(fetcher);
                self.step = Step::FetchApi;
                Ok(())
            }
            Err(e) => {
                warn!("API fetch failed: {}", e);
                self.start_index_fetch()
            }
        }
    }

    fn beacon(&self) -> Beacon {
        let diagnostics = &self.collaborators.diagnostics;
        Beacon {
            mac: self.link.mac_address(),
            uptime_secs: diagnostics.uptime_secs(),
            min_free_memory: diagnostics.min_free_memory(),
            free_disk: self.storage.free_bytes(),
            fps: diagnostics.fps(),
            version_dir: self.running_dir.clone(),
            versions_present: self.store.versions_present(),
            firmware_version: FIRMWARE_VERSION.to_string(),
            now: self.clock.wall_millis(),
            api_fetched: self.status.api_fetched,
            index_fetched: self.status.index_fetched,
        }
    }

    /// Best effort: whatever happens here, the index check follows.
    fn fetch_api_step(&mut self) -> Result<()> {
        let outcome = match self.api_read() {
            Ok(None) => return Ok(()),
            Ok(Some(validation)) => self.accept_api_payload(validation),
            Err(e) => Err(e),
        };
        self.link.close();
        self.fetcher = None;
        self.output = None;

        match outcome {
            Ok(()) => {
                info!("API file successfully fetched");
                self.status.api_fetched = self.clock.wall_millis();
            }
            Err(e) => warn!("API fetch failed ({}): {:#}", error_class(&e).as_str(), e),
        }
        if let Err(e) = self.collaborators.loader.load_definition() {
            warn!("Could not reload the data definition: {:#}", e);
        }
        self.start_index_fetch()
    }

    fn api_read(&mut self) -> Result<Option<Validation>> {
        let fetcher = self.fetcher.as_mut().context("No API fetch in progress")?;
        match fetcher.read(&mut self.link)? {
            FetchEvent::Pending => Ok(None),
            FetchEvent::Data(data) => {
                let file = self.output.as_mut().context("API temp file is not open")?;
                file.write_all(&data)?;
                Ok(None)
            }
            FetchEvent::Done(validation) => Ok(Some(validation)),
        }
    }

    /// Validates the downloaded payload before it replaces the live file.
    fn accept_api_payload(&mut self, validation: Validation) -> Result<()> {
        let Validation::Modified { etag } = validation else {
            info!("API file not modified");
            return Ok(());
        };
        if let Some(file) = self.output.take() {
            file.sync_all()?;
        }
        let bytes = self.storage.read(API_TEMP_FILE)?;
        serde_json::from_slice::<IgnoredAny>(&bytes)
            .context("Downloaded API file is not valid JSON")?;
        self.storage.move_over(API_TEMP_FILE, API_FILE)?;
        self.settings
            .set_api_etag(&self.storage, etag.as_deref().unwrap_or(""))?;
        Ok(())
    }

    fn start_index_fetch(&mut self) -> Result<()> {
        let fetcher = HttpFetcher::new(&self.settings.update_url, None, self.settings.silence_timeout_ms)?;
        self.output = Some(self.storage.create(INDEX_TEMP_FILE)?);
        self.fetcher = Some(fetcher);
        self.step = Step::FetchIndex;
        Ok(())
    }

    fn fetch_index_step(&mut self) -> Result<()> {
        let fetcher = self.fetcher.as_mut().context("No index fetch in progress")?;
        match fetcher.read(&mut self.link).context("Index fetch aborted")? {
            FetchEvent::Pending => return Ok(()),
            FetchEvent::Data(data) => {
                let file = self.output.as_mut().context("Index temp file is not open")?;
                file.write_all(&data)?;
                return Ok(());
            }
            FetchEvent::Done(_) => {}
        }
        self.link.close();
        self.fetcher = None;
        if let Some(file) = self.output.take() {
            file.sync_all()?;
        }
        info!("Index file successfully fetched");
        self.status.index_fetched = self.clock.wall_millis();

        let index = PackIndex::load(&self.storage, INDEX_TEMP_FILE)?;
        self.storage.move_over(INDEX_TEMP_FILE, INDEX_FILE)?;
        self.status.index_name = Some(index.name.clone());
        self.status.index_updated = Some(index.updated.clone());
        let selection = select_latest_enabled(&index.packs);
        self.index = Some(index);

        let Some(selection) = selection else {
            info!("No enabled versions found");
            return self.finish_update();
        };
        info!(
            "Latest enabled version is {} at {}",
            selection.dir_name, selection.url
        );
        if self.store.is_valid(&selection.dir_name) {
            info!("{} already exists and is valid", selection.dir_name);
            return self.finish_update();
        }
        self.fetcher = Some(HttpFetcher::new(
            &selection.url,
            None,
            self.settings.silence_timeout_ms,
        )?);
        self.unpacker = Some(PackUnpacker::new(
            self.storage.clone(),
            self.settings.max_unpacked_size,
        ));
        self.step = Step::FetchPack;
        Ok(())
    }

    fn fetch_pack_step(&mut self) -> Result<()> {
        let (Some(fetcher), Some(unpacker)) = (self.fetcher.as_mut(), self.unpacker.as_mut()) else {
            bail!("No pack fetch in progress");
        };
        let mut source = FetchSource::new(fetcher, &mut self.link);
        match unpacker.step(&mut source) {
            Ok(UnpackStatus::InProgress) => Ok(()),
            Ok(UnpackStatus::Complete(dir) | UnpackStatus::AlreadyValid(dir)) => {
                info!("Pack {} is ready", dir);
                self.finish_update()
            }
            Err(e) => {
                if e.kind() == ErrorClass::Integrity {
                    if let Some(dir) = unpacker.dir_name() {
                        warn!("Discarding partial pack {}", dir);
                        if let Err(destroy_error) = self.storage.destroy(dir) {
                            warn!("Could not remove {}: {}", dir, destroy_error);
                        }
                    }
                }
                Err(e).context("Pack fetch aborted")
            }
        }
    }

    /// Recomputes `@ENABLED` from the index and restarts into a newer usable
    /// version if the device has been up long enough.
    fn finish_update(&mut self) -> Result<()> {
        let latest = match &self.index {
            Some(index) => self.store.write_enabled_flags(&index.packs)?,
            None => 0,
        };

        if !self.running_dir.is_empty()
            && self.storage.is_dir(&self.running_dir)
            && self.store.select_boot()?.is_none()
        {
            warn!(
                "No runnable version would remain; keeping {} enabled",
                self.running_dir
            );
            self.store.set_enabled(&self.running_dir, true)?;
        }

        if latest > self.running_num {
            let uptime_ms = self.collaborators.diagnostics.uptime_secs() * 1000;
            if uptime_ms > self.settings.min_restart_uptime_ms {
                info!("Restarting to run v{}", latest);
                self.collaborators.system.restart();
            } else {
                info!("New version v{} is ready to run", latest);
            }
        }
        self.retry_after(self.settings.updater_success_delay_ms);
        Ok(())
    }
}

/// Taxonomy class of the first typed error in the chain.
fn error_class(error: &anyhow::Error) -> ErrorClass {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<FetchError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<UnpackError>() {
            return e.kind();
        }
        if cause.is::<RadioError>() || cause.is::<std::io::Error>() {
            return ErrorClass::Transient;
        }
    }
    ErrorClass::Protocol
}
