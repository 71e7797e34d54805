use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::{error, info, warn};

use countdown_clock::boot::{BootChoice, BootSelector, SystemControl};
use countdown_clock::clock::{SharedClock, SystemClock};
use countdown_clock::config::Settings;
use countdown_clock::diagnostics::FrameCounter;
use countdown_clock::logging;
use countdown_clock::network::{LinkTimeouts, NetworkLink};
use countdown_clock::storage::Storage;
use countdown_clock::updater::{Collaborators, DefinitionLoader, UpdateOrchestrator, API_FILE};
use countdown_clock::version;

#[cfg(target_os = "espidf")]
use esp_idf_sys as _; // Binstart

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

/// Target duration of one pass of the main loop.
const TICK_MS: u64 = 10;

#[cfg(target_os = "espidf")]
const STORAGE_ROOT: &str = "/spiflash";
#[cfg(not(target_os = "espidf"))]
const STORAGE_ROOT: &str = "flash";

/// Simulated association time of the host radio.
#[cfg(not(target_os = "espidf"))]
const HOST_JOIN_DELAY_MS: u64 = 1500;

struct DeviceReset;

impl SystemControl for DeviceReset {
    fn restart(&mut self) {
        info!("Resetting device");
        #[cfg(target_os = "espidf")]
        unsafe {
            esp_idf_sys::esp_restart();
        }
        #[cfg(not(target_os = "espidf"))]
        std::process::exit(0);
    }
}

/// Checks the cached data file after each refresh. Rendering it belongs to
/// the display layer.
struct DataDefinition {
    storage: Storage,
}

impl DefinitionLoader for DataDefinition {
    fn load_definition(&mut self) -> Result<()> {
        if !self.storage.is_file(API_FILE) {
            warn!("No cached data at /{}", API_FILE);
            return Ok(());
        }
        let bytes = self.storage.read(API_FILE)?;
        let definition: serde_json::Value = serde_json::from_slice(&bytes)?;
        let keys = definition.as_object().map_or(0, |map| map.len());
        info!("Loaded /{} ({} bytes, {} keys)", API_FILE, bytes.len(), keys);
        Ok(())
    }
}

fn main() -> Result<()> {
    #[cfg(target_os = "espidf")]
    esp_idf_svc::sys::link_patches();

    logging::init_logger().map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;
    if let Ok(level) = std::env::var("RUST_LOG") {
        if !logging::set_max_level_from_str(&level) {
            warn!("Ignoring unknown log level {:?}", level);
        }
    }
    info!("Countdown clock {}", version::full_version());

    let root = std::env::var("COUNTDOWN_CLOCK_ROOT").unwrap_or_else(|_| STORAGE_ROOT.to_string());
    let storage = Storage::new(root);
    let settings = Settings::load_or_default(&storage).unwrap_or_else(|e| {
        error!("Failed to load settings, using defaults: {:#}", e);
        Settings::default()
    });
    let clock = SystemClock::shared();

    let boot = BootSelector::new(storage.clone(), clock.clone(), settings.min_crash_restart_runtime_ms);
    match boot.last_crash() {
        Ok(Some(crash)) => warn!(
            "Last crash: {} on {} after {} s",
            crash.reason, crash.version, crash.runtime_secs
        ),
        Ok(None) => {}
        Err(e) => warn!("Could not read crash records: {:#}", e),
    }

    let Some(choice) = boot.select()? else {
        error!("No valid software; running the updater only");
        return run(storage, settings, clock, None);
    };

    install_crash_hook(boot.clone(), choice.dir_name.clone(), clock.monotonic_millis());
    let outcome = boot.run(
        &choice,
        || run(storage, settings, clock, Some(&choice)),
        &mut DeviceReset,
    );
    if let Some(outcome) = outcome {
        error!("Stopped after crash (disabled: {})", outcome.disabled);
    }
    Ok(())
}

/// A panic is a crash of the running version like any returned error.
fn install_crash_hook(boot: BootSelector, dir_name: String, started_ms: u64) {
    std::panic::set_hook(Box::new(move |info| {
        let reason = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };
        let reason = match info.location() {
            Some(location) => format!("{} at {}:{}", reason, location.file(), location.line()),
            None => reason,
        };
        boot.handle_crash(&dir_name, &reason, started_ms, &mut DeviceReset);
    }));
}

fn run(storage: Storage, settings: Settings, clock: SharedClock, running: Option<&BootChoice>) -> Result<()> {
    let version_dir = running.map_or("none", |choice| choice.dir_name.as_str());
    let frames = Rc::new(FrameCounter::new(clock.clone(), version_dir));

    let timeouts = LinkTimeouts {
        join_ms: settings.wifi_join_timeout_ms,
        connect_ms: settings.connect_timeout_ms,
    };
    let link = NetworkLink::new(make_radio(&settings, clock.clone())?, clock.clone(), timeouts);
    info!("Network MAC address: {}", link.mac_address());

    let collaborators = Collaborators {
        loader: Box::new(DataDefinition { storage: storage.clone() }),
        diagnostics: frames.clone(),
        system: Box::new(DeviceReset),
    };
    let mut updater = UpdateOrchestrator::new(link, storage, settings, clock, running, collaborators);

    loop {
        frames.tick();
        updater.step();
        delay_ms(TICK_MS);
    }
}

#[cfg(target_os = "espidf")]
fn make_radio(_settings: &Settings, _clock: SharedClock) -> Result<countdown_clock::network::wifi::EspRadio> {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    countdown_clock::network::wifi::EspRadio::new(peripherals.modem, sys_loop)
}

#[cfg(not(target_os = "espidf"))]
fn make_radio(settings: &Settings, clock: SharedClock) -> Result<countdown_clock::network::host::HostRadio> {
    let access_point = settings
        .has_wifi_credentials()
        .then(|| (settings.wifi_ssid.clone(), settings.wifi_password.clone()));
    Ok(countdown_clock::network::host::HostRadio::new(
        clock,
        access_point,
        HOST_JOIN_DELAY_MS,
    ))
}

#[cfg(target_os = "espidf")]
fn delay_ms(ms: u64) {
    esp_idf_hal::delay::FreeRtos::delay_ms(ms as u32);
}

#[cfg(not(target_os = "espidf"))]
fn delay_ms(ms: u64) {
    std::thread::sleep(std::time::Duration::from_millis(ms));
}
