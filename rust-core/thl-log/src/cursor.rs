// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Cursors and cursor manager
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A cursor is a connection's open segment plus its position. Between calls
// the cursor is parked in the `LogCursorManager`, which evicts cursors that
// sit idle too long so idle readers do not pin file descriptors. A
// connection checks its cursor out for the duration of one operation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ThlError, ThlResult};
use crate::flush::FlushRegistry;
use crate::log_file::{LogFile, OpenMode};

/// Identifies a connection within one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// LogCursor
// ---------------------------------------------------------------------------

/// An open segment and the last seqno seen through it.
#[derive(Debug)]
pub struct LogCursor {
    log_file: Arc<LogFile>,
    last_seqno: i64,
    last_access: Instant,
    loaned: bool,
    rotate_next: bool,
}

impl LogCursor {
    pub fn new(log_file: Arc<LogFile>, last_seqno: i64) -> Self {
        Self {
            log_file,
            last_seqno,
            last_access: Instant::now(),
            loaned: false,
            rotate_next: true,
        }
    }

    pub fn log_file(&self) -> &Arc<LogFile> {
        &self.log_file
    }

    pub fn last_seqno(&self) -> i64 {
        self.last_seqno
    }

    pub fn set_last_seqno(&mut self, seqno: i64) {
        self.last_seqno = seqno;
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Whether reads follow rotation markers into the next segment.
    pub fn rotate_next(&self) -> bool {
        self.rotate_next
    }

    pub fn set_rotate_next(&mut self, rotate_next: bool) {
        self.rotate_next = rotate_next;
    }

    /// Close the cursor's segment.
    pub fn release(self) {
        if let Err(e) = self.log_file.release() {
            warn!(file = %self.log_file.name(), error = %e, "Failed to release THL segment");
        }
    }
}

// ---------------------------------------------------------------------------
// LogCursorManager
// ---------------------------------------------------------------------------

struct CursorTable {
    cursors: HashMap<ConnectionId, LogCursor>,
    next_sweep: Instant,
    done: bool,
}

/// Parks idle cursors by connection and evicts the stale ones.
pub struct LogCursorManager {
    table: Mutex<CursorTable>,
    timeout: Duration,
    registry: Arc<FlushRegistry>,
}

impl LogCursorManager {
    /// `timeout` is how long a parked cursor may stay idle. Writable
    /// segments are deregistered from `registry` when their cursor goes.
    pub fn new(timeout: Duration, registry: Arc<FlushRegistry>) -> Self {
        Self {
            table: Mutex::new(CursorTable {
                cursors: HashMap::new(),
                next_sweep: deadline_after(timeout),
                done: false,
            }),
            timeout,
            registry,
        }
    }

    fn table(&self) -> MutexGuard<'_, CursorTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close a cursor, deregistering its segment if it was writable.
    pub fn discard(&self, cursor: LogCursor) {
        if cursor.log_file.mode() == OpenMode::Write {
            self.registry.remove(&cursor.log_file);
        }
        cursor.release();
    }

    /// Check out the cursor parked for `id`. A cursor that has already moved
    /// past `next_seqno` is discarded and `None` returned; cursors only move
    /// forward.
    pub fn checkout(&self, id: ConnectionId, next_seqno: i64) -> ThlResult<Option<LogCursor>> {
        let (cursor, stale) = {
            let mut table = self.table();
            if table.done {
                return Err(ThlError::LogClosed);
            }
            let stale = self.take_stale(&mut table);
            (table.cursors.remove(&id), stale)
        };
        for cursor in stale {
            self.discard(cursor);
        }

        let Some(mut cursor) = cursor else {
            return Ok(None);
        };
        if next_seqno < cursor.last_seqno {
            debug!(
                connection = %id,
                next_seqno,
                last_seqno = cursor.last_seqno,
                "Discarding cursor positioned past requested seqno"
            );
            self.discard(cursor);
            return Ok(None);
        }
        cursor.loaned = true;
        cursor.last_access = Instant::now();
        Ok(Some(cursor))
    }

    /// Park a cursor for `id`, replacing any cursor already parked there.
    pub fn checkin(&self, id: ConnectionId, mut cursor: LogCursor) {
        cursor.loaned = false;
        cursor.last_access = Instant::now();
        let displaced = {
            let mut table = self.table();
            if table.done {
                Some(cursor)
            } else {
                table.cursors.insert(id, cursor)
            }
        };
        if let Some(displaced) = displaced {
            self.discard(displaced);
        }
    }

    /// Discard the cursor parked for `id`, if any.
    pub fn discard_for(&self, id: ConnectionId) {
        let cursor = self.table().cursors.remove(&id);
        if let Some(cursor) = cursor {
            self.discard(cursor);
        }
    }

    /// Evict cursors idle longer than the timeout.
    pub fn sweep_idle(&self) -> usize {
        let stale = {
            let mut table = self.table();
            table.next_sweep = Instant::now();
            self.take_stale(&mut table)
        };
        let count = stale.len();
        for cursor in stale {
            self.discard(cursor);
        }
        count
    }

    fn take_stale(&self, table: &mut CursorTable) -> Vec<LogCursor> {
        let now = Instant::now();
        if now < table.next_sweep {
            return Vec::new();
        }
        table.next_sweep = deadline_after(self.timeout);

        let expired: Vec<ConnectionId> = table
            .cursors
            .iter()
            .filter(|(_, c)| !c.loaned && now.duration_since(c.last_access) > self.timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                debug!(connection = %id, "Evicting idle THL cursor");
                table.cursors.remove(&id)
            })
            .collect()
    }

    /// Number of parked cursors.
    pub fn size(&self) -> usize {
        self.table().cursors.len()
    }

    /// Discard every cursor and refuse further checkouts.
    pub fn release(&self) {
        let cursors: Vec<LogCursor> = {
            let mut table = self.table();
            table.done = true;
            table.cursors.drain().map(|(_, c)| c).collect()
        };
        for cursor in cursors {
            self.discard(cursor);
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now)
}
