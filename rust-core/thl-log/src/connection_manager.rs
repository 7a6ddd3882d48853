// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Connection registry
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::cursor::ConnectionId;
use crate::error::{ThlError, ThlResult};
use crate::log_file::InterruptHandle;

/// The parts of a connection the log can reach from outside: its release
/// flag and the handle that cancels its blocking reads.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSignals {
    pub released: Arc<AtomicBool>,
    pub interrupt: InterruptHandle,
}

impl ConnectionSignals {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Mark released and wake any blocked read.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.interrupt.interrupt();
    }
}

#[derive(Default)]
struct ConnectionTable {
    writer: Option<ConnectionId>,
    connections: HashMap<ConnectionId, ConnectionSignals>,
    done: bool,
}

/// Tracks live connections and enforces a single writer.
#[derive(Default)]
pub struct LogConnectionManager {
    table: Mutex<ConnectionTable>,
}

impl LogConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, ConnectionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection. Fails with `AlreadyWriting` when a writer
    /// is requested while another is live.
    pub fn register(
        &self,
        id: ConnectionId,
        readonly: bool,
        signals: ConnectionSignals,
    ) -> ThlResult<()> {
        let mut table = self.table();
        if table.done {
            return Err(ThlError::LogClosed);
        }
        if !readonly {
            if let Some(holder) = table.writer {
                return Err(ThlError::AlreadyWriting { holder: holder.0 });
            }
            table.writer = Some(id);
        }
        table.connections.insert(id, signals);
        debug!(connection = %id, readonly, "Registered THL connection");
        Ok(())
    }

    /// Forget a connection. Unknown ids are ignored.
    pub fn unregister(&self, id: ConnectionId) {
        let mut table = self.table();
        if table.writer == Some(id) {
            table.writer = None;
        }
        if table.connections.remove(&id).is_some() {
            debug!(connection = %id, "Released THL connection");
        }
    }

    pub fn writer(&self) -> Option<ConnectionId> {
        self.table().writer
    }

    pub fn count(&self) -> usize {
        self.table().connections.len()
    }

    /// Release every connection and refuse new ones.
    pub fn release_all(&self) {
        let mut table = self.table();
        table.done = true;
        table.writer = None;
        let count = table.connections.len();
        for (_, signals) in table.connections.drain() {
            signals.release();
        }
        if count > 0 {
            info!(count, "Released outstanding THL connections");
        }
    }
}
