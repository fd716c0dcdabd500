//! End-to-end fan-out through the registry: key packages flushed to real
//! (file-backed and in-memory) backends.

use tsfan::backends::dbats::MemStore;
use tsfan::{BackendId, KeyPackage, ResetMode, Timeseries};

fn ascii_to_file(path: &std::path::Path) -> Timeseries {
    let mut ts = Timeseries::new();
    ts.enable_backend(
        BackendId::Ascii,
        &format!("-f {}", path.display()),
    )
    .unwrap();
    ts
}

#[test]
fn test_flush_writes_all_enabled_backends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");

    let store = MemStore::new();
    let mut ts = ascii_to_file(&path);
    ts.set_dbats_store(Box::new(store.clone())).unwrap();
    ts.enable_backend(BackendId::Dbats, "").unwrap();

    let mut kp = KeyPackage::new(ResetMode::Leave);
    let a = kp.add_key("sys.cpu");
    let b = kp.add_key("sys.mem");
    kp.set(a, 11);
    kp.set(b, 22);
    kp.flush(&mut ts, 300).unwrap();
    drop(ts);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "sys.cpu 11 300\nsys.mem 22 300\n"
    );
    assert_eq!(store.get("sys.cpu"), Some(11));
    assert_eq!(store.get("sys.mem"), Some(22));
}

#[test]
fn test_reset_mode_zeroes_values_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ts = ascii_to_file(&path);

    let mut kp = KeyPackage::new(ResetMode::Reset);
    let k = kp.add_key("k");
    kp.set(k, 9);
    kp.flush(&mut ts, 10).unwrap();

    assert_eq!(kp.get(k), 0);
    // enabled flags survive a RESET flush
    assert_eq!(kp.enabled_size(), 1);
}

#[test]
fn test_disable_mode_clears_flags_and_set_reenables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ts = ascii_to_file(&path);

    let mut kp = KeyPackage::new(ResetMode::Disable);
    let k = kp.add_key("k");
    kp.set(k, 9);
    kp.flush(&mut ts, 10).unwrap();
    assert_eq!(kp.enabled_size(), 0);

    kp.set(k, 3);
    assert_eq!(kp.enabled_size(), 1);
    assert!(kp.is_key_enabled(k));
}

#[test]
fn test_second_flush_skips_disabled_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ts = ascii_to_file(&path);

    let mut kp = KeyPackage::new(ResetMode::Disable);
    let a = kp.add_key("a");
    let b = kp.add_key("b");
    kp.set(a, 1);
    kp.set(b, 2);
    kp.flush(&mut ts, 100).unwrap();

    // only "b" gets a new value for the next tick
    kp.set(b, 20);
    kp.flush(&mut ts, 160).unwrap();
    drop(ts);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "a 1 100\nb 2 100\nb 20 160\n"
    );
}

#[test]
fn test_late_keys_are_resolved_on_next_flush() {
    let store = MemStore::new();
    let mut ts = Timeseries::new();
    ts.set_dbats_store(Box::new(store.clone())).unwrap();
    ts.enable_backend(BackendId::Dbats, "").unwrap();

    let mut kp = KeyPackage::new(ResetMode::Leave);
    let a = kp.add_key("early");
    kp.set(a, 1);
    kp.flush(&mut ts, 60).unwrap();
    assert_eq!(store.resolve_calls(), 1);

    let b = kp.add_key("late");
    kp.set(b, 2);
    kp.flush(&mut ts, 120).unwrap();

    // one extra bulk resolution covering only the late key
    assert_eq!(store.resolve_calls(), 2);
    assert_eq!(store.get("early"), Some(1));
    assert_eq!(store.get("late"), Some(2));
}

#[test]
fn test_set_single_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ts = ascii_to_file(&path);

    ts.set_single(BackendId::Ascii, "one.off", 5, 99).unwrap();
    drop(ts);

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "one.off 5 99\n");
}
