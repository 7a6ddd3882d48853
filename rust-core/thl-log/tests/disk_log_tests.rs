// SPDX-License-Identifier: PMPL-1.0-or-later
//! Integration tests for the THL disk log: writing, reading back across
//! rotations, recovery, deletion, retention and connection rules.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use thl_log::codec::encode_event;
use thl_log::segment::data_file_name;
use thl_log::{
    ConnectionState, DiskLog, DiskLogConfig, LogFile, ReplEvent, SerializerKind, ThlError,
    ThlEvent, FIRST,
};

fn config(dir: &Path) -> DiskLogConfig {
    DiskLogConfig::new(dir)
        .with_log_file_size(10_000)
        .with_flush_interval(Duration::from_millis(50))
        .with_read_timeout(Duration::from_secs(2))
        .with_read_poll_interval(Duration::from_millis(5))
}

fn event(seqno: i64) -> ThlEvent {
    ThlEvent::new(seqno, seqno.to_string(), vec![b'x'; 100])
        .with_source_id("db-1")
        .with_epoch(7)
}

fn fill(log: &DiskLog, seqnos: std::ops::Range<i64>) {
    let mut writer = log.create_connection(false).unwrap();
    for seqno in seqnos {
        writer.store(&event(seqno), false).unwrap();
    }
    writer.commit().unwrap();
}

fn read_all(log: &DiskLog) -> Vec<ThlEvent> {
    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(FIRST, 0).unwrap());
    let mut events = Vec::new();
    while let Some(event) = reader.next(false).unwrap() {
        events.push(event);
    }
    events
}

#[test]
fn test_write_rotate_and_read_back_read_only() {
    let dir = TempDir::new().unwrap();
    {
        let log = DiskLog::prepare(config(dir.path())).unwrap();
        assert!(log.is_writable());
        assert_eq!(log.get_max_seqno(), -1);
        assert_eq!(log.get_min_seqno(), -1);

        fill(&log, 0..200);
        assert_eq!(log.get_max_seqno(), 199);
        assert!(log.file_count() > 1, "200 events should span several segments");
        log.validate().unwrap();
    }

    let log = DiskLog::prepare(config(dir.path()).with_read_only(true)).unwrap();
    assert!(!log.is_writable());
    assert_eq!(log.get_max_seqno(), 199);
    assert_eq!(log.get_min_seqno(), 0);
    log.validate().unwrap();

    let entries = log.index_entries();
    assert_eq!(entries[0].file_name, data_file_name(1));
    assert_eq!(entries[0].start_seqno, 0);
    assert_eq!(entries.last().unwrap().end_seqno, 199);

    let events = read_all(&log);
    assert_eq!(events.len(), 200);
    for (expected, read) in events.iter().enumerate() {
        assert_eq!(read, &event(expected as i64).with_source_tstamp(read.source_tstamp));
    }
}

#[test]
fn test_reads_back_full_event_contents() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path()).with_serializer(SerializerKind::Json)).unwrap();

    let stored = ThlEvent::new(0, "mysql-bin.000001:42", b"UPDATE t SET a = 1".to_vec())
        .with_epoch(3)
        .with_source_id("db-east")
        .with_shard_id("orders");
    let mut writer = log.create_connection(false).unwrap();
    writer.store(&stored, true).unwrap();

    assert_eq!(read_all(&log), vec![stored]);
}

#[test]
fn test_fragment_chains_never_span_segments() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path()).with_log_file_size(600)).unwrap();

    let mut writer = log.create_connection(false).unwrap();
    for seqno in 0..20 {
        for fragno in 0..3i16 {
            let fragment = event(seqno).with_fragment(fragno, fragno == 2);
            writer.store(&fragment, false).unwrap();
        }
    }
    writer.commit().unwrap();
    assert!(log.file_count() > 2);

    let mut reader = log.create_connection(true).unwrap();
    for entry in log.index_entries() {
        assert!(reader.seek_file(&entry.file_name).unwrap());
        let first = reader.next(false).unwrap().unwrap();
        assert_eq!(first.fragno, 0, "{} starts mid-chain", entry.file_name);
        assert_eq!(first.seqno, entry.start_seqno);
    }
}

#[test]
fn test_incomplete_chain_is_truncated_on_writable_open() {
    let dir = TempDir::new().unwrap();
    let tail = dir.path().join(data_file_name(1));
    {
        let log = DiskLog::prepare(config(dir.path())).unwrap();
        let mut writer = log.create_connection(false).unwrap();
        for seqno in 0..5 {
            writer.store(&event(seqno), false).unwrap();
        }
        writer.store(&event(5).with_fragment(0, false), false).unwrap();
        writer.store(&event(5).with_fragment(1, false), true).unwrap();
        assert_eq!(log.get_max_seqno(), 4);
    }
    let full_length = fs::metadata(&tail).unwrap().len();

    {
        let log = DiskLog::prepare(config(dir.path()).with_read_only(true)).unwrap();
        assert_eq!(log.get_max_seqno(), 4);
        let seqnos: Vec<i64> = read_all(&log).iter().map(|e| e.seqno).collect();
        assert_eq!(seqnos, vec![0, 1, 2, 3, 4]);

        let mut reader = log.create_connection(true).unwrap();
        assert!(reader.seek(5, 0).unwrap());
        assert!(reader.next(false).unwrap().is_none());
        assert!(!reader.seek(5, 1).unwrap());
    }
    assert_eq!(fs::metadata(&tail).unwrap().len(), full_length);

    let log = DiskLog::prepare(config(dir.path())).unwrap();
    assert_eq!(log.get_max_seqno(), 4);
    assert!(fs::metadata(&tail).unwrap().len() < full_length);

    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(5, 0).unwrap());
    assert!(reader.next(false).unwrap().is_none());

    let mut writer = log.create_connection(false).unwrap();
    for fragno in 0..3i16 {
        writer
            .store(&event(5).with_fragment(fragno, fragno == 2), false)
            .unwrap();
    }
    writer.commit().unwrap();
    assert_eq!(log.get_max_seqno(), 5);

    for fragno in 0..3i16 {
        let read = reader.next(false).unwrap().unwrap();
        assert_eq!((read.seqno, read.fragno), (5, fragno));
    }
}

#[test]
fn test_read_only_open_reveals_chain_once_completed() {
    let dir = TempDir::new().unwrap();
    {
        let log = DiskLog::prepare(config(dir.path())).unwrap();
        let mut writer = log.create_connection(false).unwrap();
        writer.store(&event(0), false).unwrap();
        writer.store(&event(1).with_fragment(0, false), true).unwrap();
    }

    let log = DiskLog::prepare(config(dir.path()).with_read_only(true)).unwrap();
    assert_eq!(log.get_max_seqno(), 0);
    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(1, 0).unwrap());
    assert!(reader.next(false).unwrap().is_none());

    // Finish the chain directly on disk.
    let serializer = SerializerKind::Cbor.build();
    let last = encode_event(&event(1).with_fragment(1, true), serializer.as_ref(), true).unwrap();
    let tail = LogFile::new(dir.path(), data_file_name(1));
    tail.prepare_write(-1).unwrap();
    tail.write_record(&last, 0).unwrap();
    tail.release().unwrap();

    for fragno in 0..2i16 {
        let read = reader.next(false).unwrap().unwrap();
        assert_eq!((read.seqno, read.fragno), (1, fragno));
    }
    assert!(reader.next(false).unwrap().is_none());
}

#[test]
fn test_torn_record_is_truncated_on_writable_open() {
    let dir = TempDir::new().unwrap();
    let tail = dir.path().join(data_file_name(1));
    {
        let log = DiskLog::prepare(config(dir.path())).unwrap();
        fill(&log, 0..3);
    }
    let complete_length = fs::metadata(&tail).unwrap().len();
    let mut bytes = fs::read(&tail).unwrap();
    bytes.extend_from_slice(&[0, 0, 0, 200, 1, 2, 3]);
    fs::write(&tail, bytes).unwrap();

    let log = DiskLog::prepare(config(dir.path())).unwrap();
    assert_eq!(log.get_max_seqno(), 2);
    assert_eq!(fs::metadata(&tail).unwrap().len(), complete_length);
    assert_eq!(read_all(&log).len(), 3);
}

#[test]
fn test_seek_semantics() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    fill(&log, 0..100);

    let mut reader = log.create_connection(true).unwrap();
    assert_eq!(reader.state(), ConnectionState::Created);

    assert!(reader.seek(50, 0).unwrap());
    assert_eq!(reader.state(), ConnectionState::Positioned);
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, 50);
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, 51);
    assert_eq!(reader.state(), ConnectionState::Reading);

    assert!(!reader.seek(50, 3).unwrap(), "fragment 3 of a one-fragment event");
    assert!(!reader.seek(500, 0).unwrap(), "far past the tail");
    assert!(!reader.seek(-5, 0).unwrap());

    assert!(reader.seek(100, 0).unwrap(), "the next seqno to be written");
    assert!(reader.next(false).unwrap().is_none());

    let mut writer = log.create_connection(false).unwrap();
    writer.store(&event(100), true).unwrap();
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, 100);
}

#[test]
fn test_seek_resolves_across_segments() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path()).with_log_file_size(2_000)).unwrap();
    fill(&log, 0..120);
    assert!(log.file_count() > 3);

    let mut reader = log.create_connection(true).unwrap();
    for entry in log.index_entries() {
        assert!(reader.seek(entry.end_seqno, 0).unwrap());
        assert_eq!(reader.next(false).unwrap().unwrap().seqno, entry.end_seqno);
        if entry.end_seqno < 119 {
            // Crossing the rotation marker into the next segment.
            assert_eq!(reader.next(false).unwrap().unwrap().seqno, entry.end_seqno + 1);
        }
    }
}

#[test]
fn test_log_position_mismatch() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    fill(&log, 0..10);

    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(10, 0).unwrap());

    let mut writer = log.create_connection(false).unwrap();
    writer.store(&event(12), true).unwrap();

    match reader.next(false) {
        Err(ThlError::LogPosition { expected, found }) => {
            assert_eq!(expected, 10);
            assert_eq!(found, 12);
        }
        other => panic!("expected LogPosition, got {other:?}"),
    }
}

#[test]
fn test_commit_controls_visibility() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path()).with_flush_interval(Duration::from_secs(600)))
        .unwrap();

    let mut writer = log.create_connection(false).unwrap();
    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(FIRST, 0).unwrap());

    writer.store(&event(0), false).unwrap();
    assert!(reader.next(false).unwrap().is_none());

    writer.commit().unwrap();
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, 0);
    assert_eq!(reader.read_count(), 1);
    assert_eq!(writer.write_count(), 1);
}

#[test]
fn test_blocking_read_times_out_with_none() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    let mut reader = log.create_connection(true).unwrap();
    reader.set_timeout(Duration::from_millis(100));
    assert!(reader.seek(FIRST, 0).unwrap());

    let started = Instant::now();
    assert!(reader.next(true).unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_read_filter_strips_rejected_bodies() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    fill(&log, 0..10);

    let mut reader = log.create_connection(true).unwrap();
    reader.set_read_filter(|header| header.seqno % 2 == 0);
    assert!(reader.seek(FIRST, 0).unwrap());
    while let Some(read) = reader.next(false).unwrap() {
        if read.seqno % 2 == 0 {
            assert!(matches!(read.event, Some(ReplEvent::Data { .. })));
        } else {
            assert_eq!(read.event, None);
            assert_eq!(read.event_id, read.seqno.to_string());
        }
    }

    reader.clear_read_filter();
    assert!(reader.seek(3, 0).unwrap());
    assert!(reader.next(false).unwrap().unwrap().event.is_some());
}

#[test]
fn test_rotation_to_missing_segment() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path()).with_log_file_size(2_000)).unwrap();
    fill(&log, 0..40);
    assert!(log.file_count() > 1);
    let first_end = log.index_entries()[0].end_seqno;
    fs::remove_file(dir.path().join(data_file_name(2))).unwrap();

    let mut reader = log.create_connection(true).unwrap();
    reader.set_rotate_timeout(Duration::from_millis(100));
    assert!(reader.seek(first_end, 0).unwrap());
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, first_end);

    assert!(reader.next(false).unwrap().is_none());
    assert!(matches!(
        reader.next(true),
        Err(ThlError::SegmentMissing { .. })
    ));
    assert!(matches!(log.validate(), Err(ThlError::Consistency(_))));
}

#[test]
fn test_delete_from_top_then_resume_writing() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    fill(&log, 0..200);
    let files_before = log.file_count();

    let mut writer = log.create_connection(false).unwrap();
    writer.delete(Some(150), None).unwrap();
    assert_eq!(log.get_max_seqno(), 149);
    assert!(log.file_count() <= files_before);
    log.validate().unwrap();

    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(149, 0).unwrap());
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, 149);
    assert!(reader.next(false).unwrap().is_none());

    for seqno in 150..160 {
        writer.store(&event(seqno), false).unwrap();
    }
    writer.commit().unwrap();
    assert_eq!(log.get_max_seqno(), 159);

    let seqnos: Vec<i64> = read_all(&log).iter().map(|e| e.seqno).collect();
    assert_eq!(seqnos, (0..160).collect::<Vec<_>>());
}

#[test]
fn test_delete_everything() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    fill(&log, 0..50);

    log.delete(None, None).unwrap();
    assert_eq!(log.get_max_seqno(), -1);
    assert_eq!(log.file_count(), 0);

    fill(&log, 0..5);
    assert_eq!(log.get_max_seqno(), 4);
    assert_eq!(read_all(&log).len(), 5);
}

#[test]
fn test_delete_from_bottom() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path()).with_log_file_size(2_000)).unwrap();
    fill(&log, 0..100);
    let second_start = log.index_entries()[1].start_seqno;

    log.delete(None, Some(second_start - 1)).unwrap();
    assert_eq!(log.get_min_seqno(), second_start);
    assert_eq!(log.get_max_seqno(), 99);
    log.validate().unwrap();

    let mut reader = log.create_connection(true).unwrap();
    assert!(!reader.seek(0, 1).unwrap());
    assert!(reader.seek(FIRST, 0).unwrap());
    assert_eq!(reader.next(false).unwrap().unwrap().seqno, second_start);
}

#[test]
fn test_delete_rejects_middle_range_and_live_writer() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    fill(&log, 0..100);

    assert!(matches!(
        log.delete(Some(40), Some(60)),
        Err(ThlError::InvalidDeleteRange { low: 40, high: 60 })
    ));

    let _writer = log.create_connection(false).unwrap();
    assert!(matches!(
        log.delete(Some(90), None),
        Err(ThlError::AlreadyWriting { .. })
    ));
}

#[test]
fn test_retention_purges_down_to_minimum() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(
        config(dir.path())
            .with_log_file_size(1_000)
            .with_retention(Duration::from_millis(1)),
    )
    .unwrap();
    log.set_active_seqno(Some(0));
    fill(&log, 0..60);
    assert!(log.file_count() > 2);
    std::thread::sleep(Duration::from_millis(20));
    assert!(log.purge_expired().unwrap().is_empty(), "active seqno pins the log");

    log.set_active_seqno(None);
    log.purge_expired().unwrap();
    assert_eq!(log.file_count(), 2);
    assert!(log.get_min_seqno() > 0);
    assert_eq!(log.get_max_seqno(), 59);
    log.validate().unwrap();
}

#[test]
fn test_flush_task_purges_expired_segments() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(
        config(dir.path())
            .with_log_file_size(1_000)
            .with_retention(Duration::from_secs(2)),
    )
    .unwrap();
    fill(&log, 0..60);
    assert!(log.file_count() > 2);

    let deadline = Instant::now() + Duration::from_secs(15);
    while log.file_count() > 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(log.file_count(), 2);
    assert_eq!(log.get_max_seqno(), 59);
    log.validate().unwrap();
}

#[test]
fn test_evicted_reader_resumes_without_gaps() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(
        config(dir.path())
            .with_log_file_size(1_000)
            .with_connection_timeout(Duration::from_millis(10)),
    )
    .unwrap();
    fill(&log, 0..30);

    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(FIRST, 0).unwrap());
    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(reader.next(false).unwrap().unwrap().seqno);
    }

    // Idle well past the timeout so the flush task evicts the parked cursor.
    std::thread::sleep(Duration::from_millis(200));
    fill(&log, 30..60);

    while let Some(event) = reader.next(false).unwrap() {
        seen.push(event.seqno);
    }
    assert_eq!(seen, (0..60).collect::<Vec<i64>>());
}

#[test]
fn test_connection_rules() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();

    let writer = log.create_connection(false).unwrap();
    assert!(matches!(
        log.create_connection(false),
        Err(ThlError::AlreadyWriting { holder }) if holder == writer.id().0
    ));
    drop(writer);
    let _writer = log.create_connection(false).unwrap();

    let mut reader = log.create_connection(true).unwrap();
    assert!(matches!(reader.next(false), Err(ThlError::NotPositioned)));
    assert!(matches!(
        reader.store(&event(0), false),
        Err(ThlError::NotWritable(_))
    ));

    reader.release();
    assert_eq!(reader.state(), ConnectionState::Released);
    assert!(matches!(reader.seek(FIRST, 0), Err(ThlError::UseAfterRelease)));
    reader.release();
}

#[test]
fn test_release_closes_connections() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    fill(&log, 0..3);
    let mut reader = log.create_connection(true).unwrap();
    assert!(reader.seek(FIRST, 0).unwrap());

    log.release();
    log.release();
    assert_eq!(reader.state(), ConnectionState::Released);
    assert!(matches!(reader.next(false), Err(ThlError::UseAfterRelease)));
    assert!(matches!(log.create_connection(true), Err(ThlError::LogClosed)));
}

#[test]
fn test_write_lock_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let log = DiskLog::prepare(config(dir.path())).unwrap();
    assert!(matches!(
        DiskLog::prepare(config(dir.path())),
        Err(ThlError::WriteLockHeld(_))
    ));

    let reader = DiskLog::prepare(config(dir.path()).with_read_only(true)).unwrap();
    assert!(!reader.is_writable());

    drop(log);
    let _log = DiskLog::prepare(config(dir.path())).unwrap();
}

#[test]
fn test_read_only_open_requires_existing_log() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing");
    assert!(matches!(
        DiskLog::prepare(config(&missing).with_read_only(true)),
        Err(ThlError::NotFound(_))
    ));
    assert!(matches!(
        DiskLog::prepare(config(dir.path()).with_read_only(true)),
        Err(ThlError::NotFound(_))
    ));
}

#[test]
fn test_read_only_log_refuses_writes() {
    let dir = TempDir::new().unwrap();
    {
        let log = DiskLog::prepare(config(dir.path())).unwrap();
        fill(&log, 0..3);
    }
    let log = DiskLog::prepare(config(dir.path()).with_read_only(true)).unwrap();
    let mut conn = log.create_connection(false).unwrap();
    assert!(matches!(
        conn.store(&event(3), true),
        Err(ThlError::NotWritable(_))
    ));
    assert!(matches!(log.delete(None, None), Err(ThlError::NotWritable(_))));
    assert!(log.purge_expired().unwrap().is_empty());
}
