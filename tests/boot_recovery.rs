mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{install, CountingReset};
use countdown_clock::boot::BootSelector;
use countdown_clock::clock::ManualClock;
use countdown_clock::storage::Storage;
use countdown_clock::versions::{ENABLED_MARKER, VALID_MARKER};
use tempfile::TempDir;

const MIN_RUNTIME_MS: u64 = 300_000;

#[test]
fn boots_the_only_enabled_version() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    install(&storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    install(&storage, "v2.bb", &[VALID_MARKER]);

    let boot = BootSelector::new(storage, ManualClock::new(0), MIN_RUNTIME_MS);
    let choice = boot.select().unwrap().unwrap();
    assert_eq!(choice.dir_name, "v1.aa");
    assert_eq!(choice.version.num, 1);
}

#[test]
fn long_running_crash_disables_and_restarts() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    install(&storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    install(&storage, "v2.bb", &[VALID_MARKER]);
    let clock = ManualClock::new(0);
    clock.set_wall(1_700_000_000_000);
    let boot = BootSelector::new(storage.clone(), clock.clone(), MIN_RUNTIME_MS);

    let choice = boot.select().unwrap().unwrap();
    let restarts = Rc::new(Cell::new(0));
    let outcome = boot
        .run(
            &choice,
            || {
                clock.advance(MIN_RUNTIME_MS + 1_000);
                anyhow::bail!("index out of range")
            },
            &mut CountingReset(restarts.clone()),
        )
        .unwrap();

    assert!(outcome.disabled);
    assert!(outcome.restarted);
    assert_eq!(restarts.get(), 1);
    assert!(!storage.is_file("v1.aa/@ENABLED"));
    assert!(storage.is_file("v1.aa/@VALID"));

    let record_path = outcome.record.unwrap();
    assert_eq!(record_path, "1700000301.exc");
    let record: serde_json::Value = serde_json::from_slice(&storage.read(&record_path).unwrap()).unwrap();
    assert_eq!(record["reason"], "index out of range");
    assert_eq!(record["version"], "v1.aa");
    assert_eq!(record["runtime_secs"], 301);
    assert!(record["log_excerpt"].is_array());

    // Nothing runnable is left
    assert_eq!(boot.select().unwrap(), None);
}

#[test]
fn sole_version_is_never_disabled() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    install(&storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    let clock = ManualClock::new(0);
    let boot = BootSelector::new(storage.clone(), clock.clone(), MIN_RUNTIME_MS);

    let choice = boot.select().unwrap().unwrap();
    let restarts = Rc::new(Cell::new(0));
    let outcome = boot
        .run(
            &choice,
            || {
                clock.advance(MIN_RUNTIME_MS * 2);
                anyhow::bail!("out of memory")
            },
            &mut CountingReset(restarts.clone()),
        )
        .unwrap();

    assert!(!outcome.disabled);
    assert!(outcome.restarted);
    assert!(storage.is_file("v1.aa/@ENABLED"));
    assert_eq!(boot.select().unwrap().unwrap().dir_name, "v1.aa");
}

#[test]
fn instant_crash_does_not_reset() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    install(&storage, "v1.aa", &[VALID_MARKER, ENABLED_MARKER]);
    install(&storage, "v2.bb", &[VALID_MARKER, ENABLED_MARKER]);
    let boot = BootSelector::new(storage.clone(), ManualClock::new(0), MIN_RUNTIME_MS);

    let choice = boot.select().unwrap().unwrap();
    assert_eq!(choice.dir_name, "v2.bb");
    let restarts = Rc::new(Cell::new(0));
    let outcome = boot
        .run(&choice, || anyhow::bail!("syntax error"), &mut CountingReset(restarts.clone()))
        .unwrap();

    assert!(outcome.disabled);
    assert!(!outcome.restarted);
    assert_eq!(restarts.get(), 0);
    // The next boot falls back to v1
    assert_eq!(boot.select().unwrap().unwrap().dir_name, "v1.aa");
}
