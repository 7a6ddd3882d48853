// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log crate
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The Transaction History Log (THL) is the durable core of a replicator: an
// append-only, segmented log of database change events that downstream
// replicas read back in order, resume from after a crash, and audit.
//
// # Architecture
//
// A log directory holds segment files `thl.data.0000000001`,
// `thl.data.0000000002`, ... and a lock file `thl.lock`. Exactly one process
// holds the lock and may write; any number of processes may read.
//
// Each segment begins with a 16-byte header (magic, version, base seqno)
// followed by framed records:
//
// ```text
// [4 bytes: record_length (u32 BE)]
// [N bytes: data]        -- 0x01 event fragment | 0x02 rotation marker
// [1 byte:  crc_type]    -- 0=none, 1=CRC32
// [4 bytes: crc (u32 BE)]
// ```
//
// When a segment outgrows its size threshold the writer ends it with a
// rotation marker naming the next segment, but only at a fragment-chain
// boundary, so a transaction never spans segments. Readers follow the
// marker on their own.
//
// A seqno counts as stored once its last fragment is written. On open, a
// writable log cuts off any trailing incomplete transaction.
//
// ## Usage
//
// ```no_run
// use thl_log::{DiskLog, DiskLogConfig, ThlEvent};
//
// let log = DiskLog::prepare(DiskLogConfig::new("/tmp/thl")).unwrap();
//
// let mut writer = log.create_connection(false).unwrap();
// writer.store(&ThlEvent::new(0, "0", b"insert".to_vec()), true).unwrap();
//
// let mut reader = log.create_connection(true).unwrap();
// assert!(reader.seek(0, 0).unwrap());
// while let Some(event) = reader.next(false).unwrap() {
//     println!("seqno={} event_id={}", event.seqno, event.event_id);
// }
// ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod cursor;
pub mod disk_log;
pub mod error;
pub mod event;
pub mod flush;
pub mod index;
pub mod log_file;
pub mod record;
pub mod segment;
pub mod serializer;
pub mod write_lock;

// Re-export the primary public API for ergonomic imports.
pub use config::DiskLogConfig;
pub use connection::{ConnectionState, LogConnection, ReadFilter, FIRST};
pub use disk_log::DiskLog;
pub use error::{ThlError, ThlResult};
pub use event::{EventHeader, ReplEvent, ThlEvent};
pub use index::LogIndexEntry;
pub use log_file::{InterruptHandle, LogFile};
pub use record::LogRecord;
pub use serializer::{EventSerializer, SerializerKind};
pub use write_lock::WriteLock;
