mod common;

use serde_json::json;

use common::{install, test_settings, Harness, API_HOST, PACK_HOST};
use countdown_clock::boot::BootSelector;
use countdown_clock::network::fake::FakeResponse;
use countdown_clock::pack::PackBuilder;
use countdown_clock::updater::Step;
use countdown_clock::versions::{ENABLED_MARKER, VALID_MARKER};

const CACHED: &[u8] = br#"{"cached": true}"#;

fn serve(h: &Harness, path: &str, response: FakeResponse) {
    let host = if path == "/clock.json" { API_HOST } else { PACK_HOST };
    h.net().borrow_mut().serve(&format!("{}{}", host, path), response);
}

fn index_with(packs: serde_json::Value) -> FakeResponse {
    let index = json!({"name": "stable", "updated": "2024-05-01T00:00:00Z", "packs": packs});
    FakeResponse::ok(index.to_string().as_bytes())
}

fn entry(hash: &str, enabled: bool) -> serde_json::Value {
    json!({"hash": hash, "url": format!("http://{}/{}.pk", PACK_HOST, hash), "enabled": enabled})
}

#[test]
fn full_cycle_installs_enables_and_restarts() {
    let mut h = Harness::new();
    install(&h.storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    let pack = PackBuilder::new("v2")
        .file("main.py", b"print('v2')\n".to_vec())
        .file("lib/util.py", vec![b'#'; 3000]);
    let hash = pack.hash();

    serve(
        &h,
        "/clock.json",
        FakeResponse::with_headers("200 OK", &[("ETag", "\"e1\"")], br#"{"modules": []}"#),
    );
    serve(&h, "/packs.json", index_with(json!({"v1": entry("aa", true), "v2": entry(&hash, true)})));
    serve(&h, &format!("/{}.pk", hash), FakeResponse::ok(&pack.build().unwrap()));

    h.start(test_settings(), Some("v1.aa"));
    h.run_ticks(1000);

    assert_eq!(h.storage.read("data/clock.json").unwrap(), br#"{"modules": []}"#);
    assert!(h.storage.is_file("data/packs.json"));
    assert_eq!(h.updater().settings().api_etag, "\"e1\"");
    assert_eq!(
        h.storage.read(&format!("{}/main.py", pack.dir_name())).unwrap(),
        b"print('v2')\n"
    );
    assert!(h.storage.is_file(&format!("{}/{}", pack.dir_name(), VALID_MARKER)));
    assert!(h.storage.is_file(&format!("{}/{}", pack.dir_name(), ENABLED_MARKER)));
    assert!(h.storage.is_file("v1.aa/@ENABLED"));
    assert_eq!(h.restarts.get(), 1);
    assert_eq!(h.loads.get(), 1);
    assert_eq!(h.updater().current_step(), Step::Wait);

    let status = h.updater().status().clone();
    assert_eq!(status.index_name.as_deref(), Some("stable"));
    assert_eq!(status.index_updated.as_deref(), Some("2024-05-01T00:00:00Z"));
    assert!(status.api_fetched.is_some());
    assert!(status.index_fetched.is_some());

    let net = h.net();
    let net = net.borrow();
    assert_eq!(net.requests.len(), 3);
    assert!(net.requests[0].starts_with("GET /clock.json?p=ac&mac=02%3A00%3A00%3A00%3A00%3A01&up=7200&"));
    assert!(net.requests[0].contains("&v=v1.aa&vp=v1.aa&fv="));
    assert!(!net.requests[0].contains("If-None-Match"));
    assert!(!net.socket_open());
    assert_eq!(net.opens, 3);
    assert_eq!(net.closes, 3);
}

#[test]
fn interrupted_api_fetch_keeps_cached_data() {
    let mut h = Harness::new();
    h.storage.write_atomic("data/clock.json", CACHED).unwrap();
    let response = FakeResponse::with_headers("200 OK", &[("ETag", "\"new\"")], &[b' '; 3000]);
    serve(&h, "/clock.json", response.dropped_after(1200));

    h.start(test_settings(), None);
    h.run_ticks(1000);

    assert_eq!(h.storage.read("data/clock.json").unwrap(), CACHED);
    assert_eq!(h.updater().settings().api_etag, "");
    assert_eq!(h.updater().status().api_fetched, None);
    // The data step is best effort: the presentation layer reloads and the
    // index is still requested (here it is missing, so the cycle fails)
    assert_eq!(h.loads.get(), 1);
    assert_eq!(h.net().borrow().requests.len(), 2);
    assert_eq!(h.updater().current_step(), Step::Wait);
    let failure_delay = test_settings().updater_failure_delay_ms;
    let next_check = h.updater().next_check();
    assert!(next_check > failure_delay && next_check < failure_delay + h.clock_now());
    assert!(!h.net().borrow().socket_open());
}

#[test]
fn malformed_payload_is_not_installed() {
    let mut h = Harness::new();
    h.storage.write_atomic("data/clock.json", CACHED).unwrap();
    serve(
        &h,
        "/clock.json",
        FakeResponse::with_headers("200 OK", &[("ETag", "\"bad\"")], b"{\"truncated\": "),
    );
    serve(&h, "/packs.json", index_with(json!({})));

    h.start(test_settings(), None);
    h.run_ticks(1000);

    assert_eq!(h.storage.read("data/clock.json").unwrap(), CACHED);
    assert_eq!(h.updater().settings().api_etag, "");
    assert_eq!(h.updater().status().index_name.as_deref(), Some("stable"));
    let success_delay = test_settings().updater_success_delay_ms;
    assert!(h.updater().next_check() > success_delay);
}

#[test]
fn not_modified_keeps_file_and_counts_as_fetched() {
    let mut h = Harness::new();
    h.storage.write_atomic("data/clock.json", CACHED).unwrap();
    serve(&h, "/clock.json", FakeResponse::with_headers("304 Not Modified", &[], b""));
    serve(&h, "/packs.json", index_with(json!({})));

    let mut settings = test_settings();
    settings.api_etag = "\"e0\"".to_string();
    h.start(settings, None);
    h.run_ticks(1000);

    assert_eq!(h.storage.read("data/clock.json").unwrap(), CACHED);
    assert!(h.updater().status().api_fetched.is_some());
    assert_eq!(h.updater().settings().api_etag, "\"e0\"");
    assert!(h.net().borrow().requests[0].contains("If-None-Match: \"e0\"\r\n"));
}

#[test]
fn corrupt_pack_is_discarded() {
    let mut h = Harness::new();
    install(&h.storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    let bogus = "0123456789abcdef0123456789abcdef";
    let bytes = PackBuilder::new("v2")
        .file("main.py", b"print('v2')\n".to_vec())
        .build_with_hash(bogus)
        .unwrap();
    serve(&h, "/clock.json", FakeResponse::ok(b"{}"));
    serve(&h, "/packs.json", index_with(json!({"v1": entry("aa", true), "v2": entry(bogus, true)})));
    serve(&h, &format!("/{}.pk", bogus), FakeResponse::ok(&bytes));

    h.start(test_settings(), Some("v1.aa"));
    h.run_ticks(1000);

    assert!(!h.storage.is_dir(&format!("v2.{}", bogus)));
    assert!(h.storage.is_file("v1.aa/@ENABLED"));
    assert_eq!(h.restarts.get(), 0);
    assert_eq!(h.updater().current_step(), Step::Wait);
    assert!(!h.net().borrow().socket_open());
}

#[test]
fn valid_pack_is_not_downloaded_again() {
    let mut h = Harness::new();
    h.diagnostics.0.set(10);
    install(&h.storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    install(&h.storage, "v2.bb", &[VALID_MARKER]);
    serve(&h, "/clock.json", FakeResponse::ok(b"{}"));
    serve(&h, "/packs.json", index_with(json!({"v1": entry("aa", true), "v2": entry("bb", true)})));

    h.start(test_settings(), Some("v1.aa"));
    h.run_ticks(1000);

    assert_eq!(h.net().borrow().requests.len(), 2);
    assert!(h.storage.is_file("v2.bb/@ENABLED"));
    // Not up long enough to restart into v2
    assert_eq!(h.restarts.get(), 0);
}

#[test]
fn running_version_stays_enabled_when_nothing_else_is_runnable() {
    let mut h = Harness::new();
    install(&h.storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    install(&h.storage, "v3-2.cc", &[VALID_MARKER]);
    h.storage.write_atomic("v3-2.cc/@PATH", b"v3-2.cc v2.missing").unwrap();
    serve(&h, "/clock.json", FakeResponse::ok(b"{}"));
    serve(
        &h,
        "/packs.json",
        index_with(json!({"v1": entry("aa", false), "v3-2": entry("cc", true)})),
    );

    h.start(test_settings(), Some("v1.aa"));
    h.run_ticks(1000);

    assert_eq!(h.net().borrow().requests.len(), 2);
    assert!(h.storage.is_file("v1.aa/@ENABLED"));
    assert!(!h.storage.is_file("v3-2.cc/@ENABLED"));
    assert_eq!(h.restarts.get(), 0);
}

#[test]
fn stalled_pack_download_times_out() {
    let mut h = Harness::new();
    let pack = PackBuilder::new("v2").file("big.bin", vec![1u8; 8000]);
    let hash = pack.hash();
    serve(&h, "/clock.json", FakeResponse::ok(b"{}"));
    serve(&h, "/packs.json", index_with(json!({"v2": entry(&hash, true)})));
    serve(
        &h,
        &format!("/{}.pk", hash),
        FakeResponse::ok(&pack.build().unwrap()).stalled_after(3000),
    );

    h.start(test_settings(), None);
    h.run_ticks(2500);

    assert_eq!(h.updater().current_step(), Step::Wait);
    assert!(!h.storage.is_file(&format!("{}/@VALID", pack.dir_name())));
    let net = h.net();
    let net = net.borrow();
    assert!(!net.socket_open());
    assert_eq!(net.opens, net.closes);
}

#[test]
fn waits_for_credentials() {
    let mut h = Harness::new();
    let mut settings = test_settings();
    settings.wifi_ssid.clear();
    h.start(settings, None);
    h.run_ticks(500);

    assert_eq!(h.updater().current_step(), Step::JoinWifi);
    assert_eq!(h.net().borrow().opens, 0);
}

#[test]
fn failed_cycle_retries_after_failure_delay() {
    let mut h = Harness::new();
    let mut settings = test_settings();
    settings.updater_failure_delay_ms = 5_000;
    h.start(settings, None);

    // Nothing is served: the data fetch and then the index fetch get 404
    h.run_ticks(300);
    assert_eq!(h.net().borrow().requests.len(), 2);
    h.run_ticks(300);
    assert_eq!(h.net().borrow().requests.len(), 4);
}

#[test]
fn patch_on_valid_base_is_installed_and_enabled() {
    let mut h = Harness::new();
    install(&h.storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    let patch = PackBuilder::new("v2-1")
        .file("main.py", b"print('v2 patch')\n".to_vec())
        .file("@PATH", b"v1.aa".to_vec());
    let hash = patch.hash();

    serve(&h, "/packs.json", index_with(json!({"v1": entry("aa", true), "v2-1": entry(&hash, true)})));
    serve(&h, &format!("/{}.pk", hash), FakeResponse::ok(&patch.build().unwrap()));

    h.start(test_settings(), Some("v1.aa"));
    h.run_ticks(1000);

    let dir_name = patch.dir_name();
    assert_eq!(h.storage.read(&format!("{}/@PATH", dir_name)).unwrap(), b"v1.aa");
    assert!(h.storage.is_file(&format!("{}/{}", dir_name, VALID_MARKER)));
    assert!(h.storage.is_file(&format!("{}/{}", dir_name, ENABLED_MARKER)));
    assert_eq!(h.restarts.get(), 1);

    let boot = BootSelector::new(h.storage.clone(), h.clock.clone(), 300_000);
    let choice = boot.select().unwrap().unwrap();
    assert_eq!(choice.dir_name, dir_name);
    assert_eq!(choice.search_path, vec![dir_name.clone(), "v1.aa".to_string()]);
}

#[test]
fn patch_without_valid_base_stays_disabled() {
    let mut h = Harness::new();
    install(&h.storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    install(&h.storage, "v2.bb", &[]);
    let patch = PackBuilder::new("v3-2")
        .file("main.py", b"print('v3 patch')\n".to_vec())
        .file("@PATH", b"v2.bb".to_vec());
    let hash = patch.hash();

    serve(
        &h,
        "/packs.json",
        index_with(json!({"v1": entry("aa", true), "v2": entry("bb", true), "v3-2": entry(&hash, true)})),
    );
    serve(&h, &format!("/{}.pk", hash), FakeResponse::ok(&patch.build().unwrap()));

    h.start(test_settings(), Some("v1.aa"));
    h.run_ticks(1000);

    let dir_name = patch.dir_name();
    assert!(h.storage.is_file(&format!("{}/{}", dir_name, VALID_MARKER)));
    assert!(!h.storage.is_file(&format!("{}/{}", dir_name, ENABLED_MARKER)));
    assert!(!h.storage.is_file("v2.bb/@ENABLED"));
    assert!(h.storage.is_file("v1.aa/@ENABLED"));
    assert_eq!(h.restarts.get(), 0);
}
