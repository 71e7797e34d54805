// Boot-time version selection and crash-loop protection

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::logging;
use crate::storage::Storage;
use crate::versions::{VersionName, VersionStore};

const CRASH_RECORD_SUFFIX: &str = ".exc";

/// Hardware control the firmware core needs from the board layer.
pub trait SystemControl {
    /// Resets the device. On hardware this does not return.
    fn restart(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootChoice {
    pub version: VersionName,
    pub dir_name: String,
    /// Directories to search for the version's files, in order.
    pub search_path: Vec<String>,
}

/// Persisted as `<timestamp_secs>.exc` at the storage root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
    pub reason: String,
    pub timestamp_secs: u64,
    pub runtime_secs: u64,
    pub version: String,
    pub log_excerpt: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashOutcome {
    /// `@ENABLED` was removed from the faulted version.
    pub disabled: bool,
    /// Where the crash record was written, if writing succeeded.
    pub record: Option<String>,
    /// The run lasted long enough that the device was reset.
    pub restarted: bool,
}

#[derive(Clone)]
pub struct BootSelector {
    store: VersionStore,
    clock: SharedClock,
    min_restart_runtime_ms: u64,
}

impl BootSelector {
    pub fn new(storage: Storage, clock: SharedClock, min_restart_runtime_ms: u64) -> Self {
        Self {
            store: VersionStore::new(storage),
            clock,
            min_restart_runtime_ms,
        }
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// The runnable version to start, if any.
    pub fn select(&self) -> Result<Option<BootChoice>> {
        let selected = self.store.select_boot().context("Failed to list version directories")?;
        let Some((version, dir_name)) = selected else {
            error!("No valid, enabled versions found");
            return Ok(None);
        };
        info!("Running /{} (version {})", dir_name, version.num);
        let search_path = self.store.search_path(&dir_name);
        Ok(Some(BootChoice { version, dir_name, search_path }))
    }

    /// Runs `app` as version `choice`; a returned error is handled as a crash.
    pub fn run<F>(&self, choice: &BootChoice, app: F, system: &mut dyn SystemControl) -> Option<CrashOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        let started_ms = self.clock.monotonic_millis();
        match app() {
            Ok(()) => None,
            Err(e) => Some(self.handle_crash(&choice.dir_name, &format!("{:#}", e), started_ms, system)),
        }
    }

    /// Disables the faulted version unless no other verified version is installed,
    /// records the crash, and resets if the run lasted long enough that a
    /// restart cannot turn into a tight loop.
    pub fn handle_crash(
        &self,
        dir_name: &str,
        reason: &str,
        started_ms: u64,
        system: &mut dyn SystemControl,
    ) -> CrashOutcome {
        error!("/{} crashed: {}", dir_name, reason);

        // Partial downloads without @VALID do not count as a fallback
        let fallbacks = self
            .store
            .candidates()
            .map(|found| {
                found
                    .iter()
                    .filter(|(_, name)| name != dir_name && self.store.is_valid(name))
                    .count()
            })
            .unwrap_or(0);
        let mut disabled = false;
        if fallbacks > 0 {
            warn!("Disabling /{} due to crash", dir_name);
            match self.store.set_enabled(dir_name, false) {
                Ok(()) => disabled = true,
                Err(e) => error!("Could not disable /{}: {}", dir_name, e),
            }
        } else {
            warn!("/{} is the last available version; not disabling", dir_name);
        }

        let runtime_ms = self.clock.monotonic_millis().saturating_sub(started_ms);
        let record = match self.write_crash_record(dir_name, reason, runtime_ms) {
            Ok(path) => {
                info!("Wrote crash record to {}", path);
                Some(path)
            }
            Err(e) => {
                error!("Could not write crash record: {:#}", e);
                None
            }
        };

        let restarted = runtime_ms >= self.min_restart_runtime_ms;
        if restarted {
            info!("Running time was {} s; restarting", runtime_ms / 1000);
            system.restart();
        } else {
            warn!("Running time was only {} s; not restarting", runtime_ms / 1000);
        }
        CrashOutcome { disabled, record, restarted }
    }

    fn write_crash_record(&self, dir_name: &str, reason: &str, runtime_ms: u64) -> Result<String> {
        let timestamp_secs = self
            .clock
            .wall_millis()
            .unwrap_or_else(|| self.clock.monotonic_millis())
            / 1000;
        let record = CrashRecord {
            reason: reason.to_string(),
            timestamp_secs,
            runtime_secs: runtime_ms / 1000,
            version: dir_name.to_string(),
            log_excerpt: logging::recent_lines(),
        };
        let path = format!("{}{}", timestamp_secs, CRASH_RECORD_SUFFIX);
        self.store.storage().write_json_atomic(&path, &record)?;
        Ok(path)
    }

    /// The newest crash record at the storage root, if any parses.
    pub fn last_crash(&self) -> Result<Option<CrashRecord>> {
        let storage = self.store.storage();
        let newest = storage
            .list_root()?
            .into_iter()
            .filter_map(|name| {
                let secs = name.strip_suffix(CRASH_RECORD_SUFFIX)?.parse::<u64>().ok()?;
                Some((secs, name))
            })
            .max();
        let Some((_, name)) = newest else {
            return Ok(None);
        };
        let text = storage.read_to_string(&name)?;
        Ok(serde_json::from_str(&text).ok())
    }
}
