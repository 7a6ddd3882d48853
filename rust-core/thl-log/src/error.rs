// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Error types
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Structural failures (I/O, corruption, lock contention, API misuse) are
// errors. Absence of data is not: empty records, `None` and `false` carry
// "nothing there yet" back to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during THL operations.
#[derive(Debug, Error)]
pub enum ThlError {
    /// A filesystem or permission failure.
    #[error("THL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record or segment header is structurally invalid. This points at
    /// disk damage and must stop processing of the segment.
    #[error("Log corruption in {file} at offset {offset}: {reason}")]
    LogCorruption {
        /// Segment file name.
        file: String,
        /// Byte offset of the offending record or header.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// CRC32 checksum mismatch on a record payload.
    #[error("CRC mismatch in {file} at offset {offset}: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// Segment file name.
        file: String,
        /// Byte offset of the record.
        offset: u64,
        /// The checksum stored in the record trailer.
        stored: u32,
        /// The checksum computed over the record data.
        computed: u32,
    },

    /// A read-only open found no log, or a named segment does not exist.
    #[error("Log not found: {0}")]
    NotFound(String),

    /// A second write connection was requested while one is active.
    #[error("Log already has an active writer (connection {holder})")]
    AlreadyWriting {
        /// Id of the connection currently holding write access.
        holder: u64,
    },

    /// A writable open found the directory lock held by another instance.
    #[error("Write lock {0} is held by another process")]
    WriteLockHeld(PathBuf),

    /// The connection was used after `release()`.
    #[error("Connection used after release")]
    UseAfterRelease,

    /// The log has been released and accepts no further connections.
    #[error("Illegal access on closed log")]
    LogClosed,

    /// A write was attempted on a read-only connection or log.
    #[error("Log is not writable: {0}")]
    NotWritable(String),

    /// `next()` was called before any successful `seek()`.
    #[error("Must seek before attempting to read next event")]
    NotPositioned,

    /// The first event read after a tail seek is not the one sought.
    #[error("Log seek failure: expected seqno {expected}, found seqno {found}")]
    LogPosition {
        /// The seqno the connection was positioned at.
        expected: i64,
        /// The seqno actually read.
        found: i64,
    },

    /// A rotation marker named a segment that never appeared.
    #[error("Next log file {file} does not exist after waiting {waited_ms} ms")]
    SegmentMissing {
        /// The segment named by the rotation marker.
        file: String,
        /// How long the reader waited for it.
        waited_ms: u128,
    },

    /// A blocking read was cancelled through the connection's interrupt handle.
    #[error("Blocking read interrupted")]
    Interrupted,

    /// `delete` was called with a range that touches neither end of the log.
    #[error("Deletion range [{low}, {high}] must include the minimum or maximum seqno")]
    InvalidDeleteRange {
        /// Effective low bound.
        low: i64,
        /// Effective high bound.
        high: i64,
    },

    /// The log index failed its consistency check.
    #[error("Log consistency check failed: {0}")]
    Consistency(String),

    /// An event body could not be serialized or deserialized.
    #[error("Event serialization error: {0}")]
    Serialization(String),

    /// The configuration is invalid.
    #[error("Invalid THL configuration: {0}")]
    Config(String),
}

impl ThlError {
    /// Returns `true` for errors that indicate damaged log contents.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::LogCorruption { .. } | Self::CrcMismatch { .. })
    }

    pub(crate) fn corruption(file: &str, offset: u64, reason: impl Into<String>) -> Self {
        Self::LogCorruption {
            file: file.to_string(),
            offset,
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for THL results.
pub type ThlResult<T> = Result<T, ThlError>;
