// Diagnostic parameters carried by the routine data request

use crate::clock::millis_to_isoformat;

#[derive(Debug, Clone, Default)]
pub struct Beacon {
    pub mac: String,
    pub uptime_secs: u64,
    pub min_free_memory: u64,
    pub free_disk: u64,
    pub fps: f32,
    /// Directory of the running version.
    pub version_dir: String,
    pub versions_present: Vec<String>,
    pub firmware_version: String,
    /// Wall-clock times in epoch milliseconds, when known.
    pub now: Option<u64>,
    pub api_fetched: Option<u64>,
    pub index_fetched: Option<u64>,
}

impl Beacon {
    pub fn query(&self) -> String {
        let fields = [
            ("p", "ac".to_string()),
            ("mac", self.mac.clone()),
            ("up", self.uptime_secs.to_string()),
            ("mem", self.min_free_memory.to_string()),
            ("disk", self.free_disk.to_string()),
            ("fps", format!("{:.1}", self.fps)),
            ("v", self.version_dir.clone()),
            ("vp", self.versions_present.join(",")),
            ("fv", self.firmware_version.clone()),
            ("t", millis_to_isoformat(self.now)),
            ("af", millis_to_isoformat(self.api_fetched)),
            ("if", millis_to_isoformat(self.index_fetched)),
        ];
        fields
            .iter()
            .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// `api_url` with the beacon appended as its query string.
    pub fn request_url(&self, api_url: &str) -> String {
        let separator = if api_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", api_url, separator, self.query())
    }
}
