//! Ingest state-machine behavior against a file-backed downstream.

use std::path::Path;

use tsfan::codec;
use tsfan::{BackendId, Timeseries};
use tsfan_proxy::Ingest;

fn ingest_to_file(path: &Path, channel: &str, filters: Vec<String>) -> Ingest {
    let mut ts = Timeseries::new();
    ts.enable_backend(BackendId::Ascii, &format!("-f {}", path.display()))
        .unwrap();
    Ingest::new(ts, channel, filters, None)
}

fn message(time: u32, channel: &str, records: &[(&str, u64)]) -> Vec<u8> {
    let records: Vec<(&[u8], u64)> = records
        .iter()
        .map(|&(k, v)| (k.as_bytes(), v))
        .collect();
    codec::encode(time, channel.as_bytes(), &records).unwrap()
}

#[test]
fn test_flush_happens_once_per_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", Vec::new());

    ingest
        .handle_message(&message(100, "ch1", &[("a", 1), ("b", 2)]))
        .unwrap();
    ingest
        .handle_message(&message(100, "ch1", &[("c", 3)]))
        .unwrap();

    // same timestamp: nothing downstream yet
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    assert_eq!(ingest.current_time(), 100);

    // the timestamp advances: exactly one flush with the union of keys
    ingest
        .handle_message(&message(160, "ch1", &[("a", 9)]))
        .unwrap();
    assert_eq!(ingest.current_time(), 160);
    drop(ingest);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "a 1 100\nb 2 100\nc 3 100\n"
    );
}

#[test]
fn test_later_value_for_same_key_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", Vec::new());

    ingest
        .handle_message(&message(100, "ch1", &[("a", 1)]))
        .unwrap();
    ingest
        .handle_message(&message(100, "ch1", &[("a", 7)]))
        .unwrap();
    ingest.maybe_flush(None).unwrap();
    drop(ingest);

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a 7 100\n");
}

#[test]
fn test_filter_prefixes_drop_foreign_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", vec!["a.".to_owned()]);

    ingest
        .handle_message(&message(100, "ch1", &[("a.x", 1), ("b.y", 2)]))
        .unwrap();
    ingest.maybe_flush(None).unwrap();
    drop(ingest);

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a.x 1 100\n");
}

#[test]
fn test_force_flush_drains_current_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", Vec::new());

    ingest
        .handle_message(&message(100, "ch1", &[("a", 1)]))
        .unwrap();
    ingest.maybe_flush(None).unwrap();
    // a force flush with nothing buffered is a no-op
    ingest.maybe_flush(None).unwrap();
    drop(ingest);

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "a 1 100\n");
}

#[test]
fn test_flushed_keys_do_not_leak_into_next_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", Vec::new());

    ingest
        .handle_message(&message(100, "ch1", &[("a", 1), ("b", 2)]))
        .unwrap();
    // only "b" arrives for the next timestamp
    ingest
        .handle_message(&message(160, "ch1", &[("b", 20)]))
        .unwrap();
    ingest.maybe_flush(None).unwrap();
    drop(ingest);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "a 1 100\nb 2 100\nb 20 160\n"
    );
}

#[test]
fn test_channel_mismatch_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", Vec::new());

    ingest
        .handle_message(&message(100, "other", &[("a", 1)]))
        .unwrap();
    assert_eq!(ingest.kp().size(), 0);
    assert_eq!(ingest.current_time(), 0);
}

#[test]
fn test_malformed_messages_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", Vec::new());

    // too short for the fixed header
    ingest.handle_message(b"TSK").unwrap();
    // wrong version byte
    let mut bad_version = message(100, "ch1", &[("a", 1)]);
    bad_version[8] = 9;
    ingest.handle_message(&bad_version).unwrap();

    assert_eq!(ingest.kp().size(), 0);

    // a good message afterwards still lands
    ingest
        .handle_message(&message(100, "ch1", &[("a", 1)]))
        .unwrap();
    assert_eq!(ingest.kp().size(), 1);
}

#[test]
fn test_truncated_record_keeps_earlier_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let mut ingest = ingest_to_file(&path, "ch1", Vec::new());

    let mut msg = message(100, "ch1", &[("a", 1), ("b", 2)]);
    msg.truncate(msg.len() - 3);
    ingest.handle_message(&msg).unwrap();

    // the first record parsed before the truncation point
    assert_eq!(ingest.kp().size(), 1);
    assert_eq!(ingest.kp().get_key("a"), Some(0));
}
