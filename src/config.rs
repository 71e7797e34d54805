use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::Storage;

const FACTORY_PREFS: &str = "prefs.json";
const USER_PREFS: &str = "data/prefs.json";

const DISK_CAPACITY: u64 = 2 * 1024 * 1024; // total flash disk space available
const MAX_ROOT_SIZE: u64 = 512 * 1024; // reserved for root files and lib/

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,

    // Data and update endpoints
    pub api_url: String,
    pub update_url: String,
    pub api_etag: String,

    // Updater scheduling (milliseconds)
    pub updater_initial_delay_ms: u64,
    pub updater_wifi_delay_ms: u64,
    pub updater_failure_delay_ms: u64,
    pub updater_success_delay_ms: u64,
    pub min_restart_uptime_ms: u64,

    // Network timeouts (milliseconds)
    pub wifi_join_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub silence_timeout_ms: u64,

    // Pack limits; at least 4 versions should fit in flash
    pub max_unpacked_size: u64,

    // Boot
    pub min_crash_restart_runtime_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        // WiFi credentials come from build.rs (wifi_config.h), which is not committed
        Self {
            wifi_ssid: env!("WIFI_SSID").to_string(),
            wifi_password: env!("WIFI_PASSWORD").to_string(),
            api_url: "https://api.climateclock.world/v2/portable_m4/clock.json".to_string(),
            update_url: "https://climateclock.github.io/packs.json".to_string(),
            api_etag: String::new(),
            updater_initial_delay_ms: 2 * 1000,
            updater_wifi_delay_ms: 3 * 1000,
            updater_failure_delay_ms: 60 * 1000,
            updater_success_delay_ms: 60 * 60 * 1000,
            min_restart_uptime_ms: 60 * 60 * 1000,
            wifi_join_timeout_ms: 15 * 1000,
            connect_timeout_ms: 15 * 1000,
            silence_timeout_ms: 10 * 1000,
            max_unpacked_size: (DISK_CAPACITY - MAX_ROOT_SIZE) / 4,
            min_crash_restart_runtime_ms: 300 * 1000,
        }
    }
}

impl Settings {
    /// Defaults, overlaid with `prefs.json`, overlaid with `data/prefs.json`.
    /// Creates `data/prefs.json` when it does not exist yet.
    pub fn load_or_default(storage: &Storage) -> Result<Self> {
        let mut merged = match serde_json::to_value(Settings::default())? {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        for layer in [FACTORY_PREFS, USER_PREFS] {
            match read_layer(storage, layer) {
                Ok(Some(map)) => {
                    log::info!("Loaded settings from /{}", layer);
                    merged.extend(map);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Could not load /{}: {:?}", layer, e),
            }
        }

        let settings: Settings = serde_json::from_value(Value::Object(merged))?;

        if !storage.is_file(USER_PREFS) {
            log::info!("Creating /{}", USER_PREFS);
            if let Err(e) = settings.save(storage) {
                log::warn!("Could not write /{}: {:?}", USER_PREFS, e);
            }
        }
        Ok(settings)
    }

    pub fn save(&self, storage: &Storage) -> Result<()> {
        storage.write_json_atomic(USER_PREFS, self)?;
        log::debug!("Settings saved to /{}", USER_PREFS);
        Ok(())
    }

    /// Records the validation tag of the last accepted data payload.
    pub fn set_api_etag(&mut self, storage: &Storage, etag: &str) -> Result<()> {
        if self.api_etag != etag {
            self.api_etag = etag.to_string();
            log::info!("Set pref: api_etag = {:?}", etag);
            self.save(storage)?;
        }
        Ok(())
    }

    pub fn has_wifi_credentials(&self) -> bool {
        !self.wifi_ssid.is_empty()
    }
}

fn read_layer(storage: &Storage, rel: &str) -> Result<Option<Map<String, Value>>> {
    if !storage.is_file(rel) {
        return Ok(None);
    }
    match serde_json::from_slice(&storage.read(rel)?)? {
        Value::Object(map) => Ok(Some(map)),
        other => anyhow::bail!("expected a JSON object, found {}", other),
    }
}
