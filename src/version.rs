// Centralized version information

// Firmware (radio/board support) version reported in the telemetry beacon
pub const FIRMWARE_VERSION: &str = "v0.7-rust";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Full version string including Cargo version
pub fn full_version() -> String {
    format!("{} ({})", FIRMWARE_VERSION, CARGO_VERSION)
}
