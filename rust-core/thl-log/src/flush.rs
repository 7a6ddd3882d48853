// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Background flush task
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Writable segments are registered with a `FlushRegistry`. The `LogFlushTask`
// thread wakes every flush interval, flushes every registered segment and
// then runs housekeeping (retention purge, idle cursor sweep). A flush acts
// as an implicit commit: it makes buffered events visible to readers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ThlResult;
use crate::log_file::LogFile;

// ---------------------------------------------------------------------------
// FlushRegistry
// ---------------------------------------------------------------------------

/// Concurrent set of segments the flush task keeps flushing.
#[derive(Debug, Default)]
pub struct FlushRegistry {
    files: Mutex<HashMap<PathBuf, Arc<LogFile>>>,
}

impl FlushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<LogFile>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, log_file: Arc<LogFile>) {
        self.files().insert(log_file.path().to_path_buf(), log_file);
    }

    pub fn remove(&self, log_file: &LogFile) {
        self.files().remove(log_file.path());
    }

    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    /// Flush every registered segment. The registry lock is not held while
    /// flushing, so registration never waits on disk I/O.
    pub fn flush_all(&self) -> ThlResult<()> {
        let snapshot: Vec<Arc<LogFile>> = self.files().values().cloned().collect();
        for log_file in snapshot {
            log_file.flush()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogFlushTask
// ---------------------------------------------------------------------------

/// Work run after every flush.
pub type Housekeeping = Box<dyn Fn() + Send>;

/// Background thread flushing a [`FlushRegistry`] on a fixed interval.
pub struct LogFlushTask {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LogFlushTask {
    /// Start the task. `housekeeping` runs after each flush.
    pub fn start(
        interval: Duration,
        registry: Arc<FlushRegistry>,
        housekeeping: Option<Housekeeping>,
    ) -> ThlResult<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("thl-flush".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis(), "THL flush task started");
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if let Err(e) = registry.flush_all() {
                        warn!(error = %e, "THL flush task failed to flush segments");
                    }
                    if let Some(housekeeping) = &housekeeping {
                        housekeeping();
                    }
                }
                debug!("THL flush task stopped");
            })?;
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the task and wait for it to exit. Safe to call twice.
    pub fn cancel(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("THL flush task panicked");
            }
        }
    }
}

impl Drop for LogFlushTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
