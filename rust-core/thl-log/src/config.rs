// SPDX-License-Identifier: PMPL-1.0-or-later
//! Disk log configuration.
//!
//! Durations are stored as milliseconds so the config reads naturally as
//! JSON; accessors hand them out as [`Duration`]s.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ThlError, ThlResult};
use crate::log_file::DEFAULT_BUFFER_SIZE;
use crate::serializer::SerializerKind;

/// Configuration for a [`DiskLog`](crate::DiskLog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLogConfig {
    /// Directory holding segments and the lock file.
    pub log_dir: PathBuf,
    /// Open without taking the write lock; stores are refused.
    pub read_only: bool,
    /// Segment size in bytes after which the writer rotates at the next
    /// fragment-chain boundary.
    pub log_file_size: u64,
    /// Write CRC32 checksums and validate them on read.
    pub checksum: bool,
    /// Interval between background flushes.
    pub flush_interval_ms: u64,
    /// Writer buffer capacity in bytes.
    pub buffer_size: usize,
    /// How long a blocking `next()` waits for data before returning `None`.
    pub read_timeout_ms: u64,
    /// Sleep between checks while a read is blocked.
    pub read_poll_interval_ms: u64,
    /// How long a reader waits for the segment named by a rotation marker.
    pub rotate_timeout_ms: u64,
    /// Age after which segments may be purged. 0 keeps everything.
    pub retention_ms: u64,
    /// Idle time after which a parked cursor is closed.
    pub connection_timeout_ms: u64,
    /// Event body serializer.
    pub serializer: SerializerKind,
}

impl DiskLogConfig {
    /// Defaults with the given log directory.
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> ThlResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ThlError::Config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_log_file_size(mut self, log_file_size: u64) -> Self {
        self.log_file_size = log_file_size;
        self
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_rotate_timeout(mut self, timeout: Duration) -> Self {
        self.rotate_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_ms = duration_ms(retention);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn read_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_poll_interval_ms)
    }

    pub fn rotate_timeout(&self) -> Duration {
        Duration::from_millis(self.rotate_timeout_ms)
    }

    /// `None` when retention is disabled.
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_ms > 0).then(|| Duration::from_millis(self.retention_ms))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Reject settings the log cannot run with.
    pub fn validate(&self) -> ThlResult<()> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(ThlError::Config("log_dir must be set".to_string()));
        }
        if self.log_file_size == 0 {
            return Err(ThlError::Config("log_file_size must be greater than 0".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(ThlError::Config("buffer_size must be greater than 0".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(ThlError::Config("flush_interval_ms must be greater than 0".to_string()));
        }
        if self.read_poll_interval_ms == 0 {
            return Err(ThlError::Config(
                "read_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DiskLogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::new(),
            read_only: false,
            log_file_size: 1_000_000_000,
            checksum: true,
            flush_interval_ms: 500,
            buffer_size: DEFAULT_BUFFER_SIZE,
            read_timeout_ms: 24 * 60 * 60 * 1000,
            read_poll_interval_ms: 50,
            rotate_timeout_ms: 60_000,
            retention_ms: 0,
            connection_timeout_ms: 8 * 60 * 60 * 1000,
            serializer: SerializerKind::default(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid_once_dir_is_set() {
        assert!(DiskLogConfig::default().validate().is_err());
        let config = DiskLogConfig::new("/var/lib/thl");
        config.validate().unwrap();
        assert!(config.checksum);
        assert_eq!(config.retention(), None);
        assert_eq!(config.serializer, SerializerKind::Cbor);
    }

    #[test]
    fn test_zero_size_rejected() {
        let config = DiskLogConfig::new("/var/lib/thl").with_log_file_size(0);
        assert!(matches!(config.validate(), Err(ThlError::Config(_))));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thl.json");
        fs::write(
            &path,
            r#"{ "log_dir": "/data/thl", "log_file_size": 10000, "serializer": "json", "retention_ms": 60000 }"#,
        )
        .unwrap();

        let config = DiskLogConfig::from_json_file(&path).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/data/thl"));
        assert_eq!(config.log_file_size, 10_000);
        assert_eq!(config.serializer, SerializerKind::Json);
        assert_eq!(config.retention(), Some(Duration::from_secs(60)));
        assert_eq!(config.flush_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thl.json");
        fs::write(&path, "{ log_dir = }").unwrap();
        assert!(matches!(
            DiskLogConfig::from_json_file(&path),
            Err(ThlError::Config(_))
        ));
    }
}
