#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use countdown_clock::boot::{BootChoice, SystemControl};
use countdown_clock::clock::ManualClock;
use countdown_clock::config::Settings;
use countdown_clock::diagnostics::Diagnostics;
use countdown_clock::network::fake::{FakeNet, FakeRadio};
use countdown_clock::network::{LinkTimeouts, NetworkLink};
use countdown_clock::storage::Storage;
use countdown_clock::updater::{Collaborators, DefinitionLoader, UpdateOrchestrator};
use countdown_clock::versions::VersionName;

pub const API_HOST: &str = "api.example.org";
pub const PACK_HOST: &str = "packs.example.org";
pub const TICK_MS: u64 = 10;

pub struct CountingLoader(pub Rc<Cell<usize>>);

impl DefinitionLoader for CountingLoader {
    fn load_definition(&mut self) -> Result<()> {
        self.0.set(self.0.get() + 1);
        Ok(())
    }
}

pub struct FixedDiagnostics(pub Cell<u64>);

impl Diagnostics for FixedDiagnostics {
    fn uptime_secs(&self) -> u64 {
        self.0.get()
    }

    fn fps(&self) -> f32 {
        20.0
    }

    fn min_free_memory(&self) -> u64 {
        40_000
    }
}

pub struct CountingReset(pub Rc<Cell<usize>>);

impl SystemControl for CountingReset {
    fn restart(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

pub fn test_settings() -> Settings {
    Settings {
        wifi_ssid: "ssid".to_string(),
        wifi_password: "password".to_string(),
        api_url: format!("http://{}/clock.json", API_HOST),
        update_url: format!("http://{}/packs.json", PACK_HOST),
        updater_initial_delay_ms: 100,
        updater_wifi_delay_ms: 50,
        ..Settings::default()
    }
}

/// Writes a version directory with the given marker files.
pub fn install(storage: &Storage, dir: &str, markers: &[&str]) {
    storage.write_atomic(&format!("{}/main.py", dir), b"# app").unwrap();
    for marker in markers {
        storage.write_atomic(&format!("{}/{}", dir, marker), b"").unwrap();
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub storage: Storage,
    pub clock: Arc<ManualClock>,
    pub radio: FakeRadio,
    pub loads: Rc<Cell<usize>>,
    pub restarts: Rc<Cell<usize>>,
    pub diagnostics: Rc<FixedDiagnostics>,
    pub updater: Option<UpdateOrchestrator<FakeRadio>>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let clock = ManualClock::new(0);
        clock.set_wall(1_700_000_000_000);
        Self {
            dir,
            storage,
            clock,
            radio: FakeRadio::new(),
            loads: Rc::new(Cell::new(0)),
            restarts: Rc::new(Cell::new(0)),
            diagnostics: Rc::new(FixedDiagnostics(Cell::new(2 * 3600))),
            updater: None,
        }
    }

    pub fn net(&self) -> Rc<RefCell<FakeNet>> {
        self.radio.net()
    }

    /// Builds the orchestrator as if `running` (e.g. `v1.aa`) had booted.
    pub fn start(&mut self, settings: Settings, running: Option<&str>) {
        let choice = running.map(|dir_name| BootChoice {
            version: VersionName::parse(dir_name).unwrap(),
            dir_name: dir_name.to_string(),
            search_path: vec![dir_name.to_string()],
        });
        let link = NetworkLink::new(self.radio.clone(), self.clock.clone(), LinkTimeouts::default());
        let collaborators = Collaborators {
            loader: Box::new(CountingLoader(self.loads.clone())),
            diagnostics: self.diagnostics.clone(),
            system: Box::new(CountingReset(self.restarts.clone())),
        };
        self.updater = Some(UpdateOrchestrator::new(
            link,
            self.storage.clone(),
            settings,
            self.clock.clone(),
            choice.as_ref(),
            collaborators,
        ));
    }

    pub fn updater(&mut self) -> &mut UpdateOrchestrator<FakeRadio> {
        self.updater.as_mut().unwrap()
    }

    pub fn tick(&mut self) {
        self.clock.advance(TICK_MS);
        self.updater().step();
    }

    pub fn run_ticks(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }
}

impl Harness {
    pub fn clock_now(&self) -> u64 {
        use countdown_clock::clock::Clock;
        self.clock.monotonic_millis()
    }
}
