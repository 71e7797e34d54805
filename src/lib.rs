//! Firmware core for the countdown display: the non-blocking network link,
//! HTTP fetcher, update-pack unpacker, update orchestrator and boot-time
//! version selection. Everything here is driven from a single cooperative
//! tick loop; no component blocks waiting on the network.

pub mod boot;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod http;
pub mod logging;
pub mod network;
pub mod pack;
pub mod storage;
pub mod stream_buffer;
pub mod updater;
pub mod version;
pub mod versions;

/// Coarse classification used when logging failures and deciding recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and socket errors; retry later.
    Transient,
    /// Bad status codes, bad magic, malformed documents; abort this cycle.
    Protocol,
    /// Hash mismatch or size ceiling exceeded; discard the partial pack.
    Integrity,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Integrity => "integrity",
        }
    }
}
