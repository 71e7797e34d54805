use std::env;
use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds (simulator and tests) skip it
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }

    println!("cargo:rerun-if-changed=wifi_config.h");

    // Read WiFi configuration if it exists
    let wifi_config_path = "wifi_config.h";
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;

        let mut ssid = String::new();
        let mut password = String::new();
        if let Some(ssid_line) = contents.lines().find(|l| l.contains("#define WIFI_SSID")) {
            if let Some(value) = ssid_line.split('"').nth(1) {
                ssid = value.to_string();
            }
        }
        if let Some(pass_line) = contents.lines().find(|l| l.contains("#define WIFI_PASSWORD")) {
            if let Some(value) = pass_line.split('"').nth(1) {
                password = value.to_string();
            }
        }
        println!("cargo:rustc-env=WIFI_SSID={}", ssid);
        println!("cargo:rustc-env=WIFI_PASSWORD={}", password);
    } else {
        // Empty defaults; credentials can still be set in data/prefs.json
        println!("cargo:rustc-env=WIFI_SSID=");
        println!("cargo:rustc-env=WIFI_PASSWORD=");
    }

    Ok(())
}
