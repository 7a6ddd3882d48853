// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Client connections
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `LogConnection` is one client's view of the log: readers `seek()` and
// then call `next()`; the single writer calls `store()` and `commit()`.
// Each connection has its own segment handles, so readers never contend
// with one another or with the writer.

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::codec::{decode_rotate, encode_event, EventRecord};
use crate::connection_manager::ConnectionSignals;
use crate::cursor::{ConnectionId, LogCursor};
use crate::disk_log::LogShared;
use crate::error::{ThlError, ThlResult};
use crate::event::{EventHeader, ThlEvent};
use crate::log_file::{InterruptHandle, LogFile, OpenMode};
use crate::record::{LogRecord, RecordType};
use crate::segment::data_file_name;

/// Seqno that positions a reader at the very start of the log.
pub const FIRST: i64 = 0;

/// Decides whether a read returns an event's body. Events it rejects come
/// back with header fields only.
pub type ReadFilter = Box<dyn Fn(&EventHeader) -> bool + Send + Sync>;

/// Lifecycle of a connection.
///
/// `seek()` and `seek_file()` run to completion on the caller's thread, so
/// there is no separate seeking state: a connection moves from `Created`
/// straight to `Positioned` when a seek succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Positioned,
    Reading,
    Writing,
    Released,
}

/// Where the connection's cursor was when last parked, so an evicted cursor
/// can be reopened.
#[derive(Debug, Clone)]
struct CursorPosition {
    file_name: String,
    offset: u64,
    last_seqno: i64,
    rotate_next: bool,
    writable: bool,
}

/// A client handle on a [`DiskLog`](crate::DiskLog).
pub struct LogConnection {
    id: ConnectionId,
    readonly: bool,
    log: Arc<LogShared>,
    signals: ConnectionSignals,
    state: ConnectionState,
    position: Option<CursorPosition>,
    pending_event: Option<ThlEvent>,
    pending_seqno: Option<i64>,
    read_filter: Option<ReadFilter>,
    timeout: Duration,
    rotate_timeout: Duration,
    read_count: u64,
    write_count: u64,
}

impl LogConnection {
    pub(crate) fn open(log: Arc<LogShared>, id: ConnectionId, readonly: bool) -> ThlResult<Self> {
        let signals = ConnectionSignals::default();
        log.connections.register(id, readonly, signals.clone())?;
        Ok(Self {
            id,
            readonly,
            timeout: log.config.read_timeout(),
            rotate_timeout: log.config.rotate_timeout(),
            log,
            signals,
            state: ConnectionState::Created,
            position: None,
            pending_event: None,
            pending_seqno: None,
            read_filter: None,
            read_count: 0,
            write_count: 0,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn state(&self) -> ConnectionState {
        if self.signals.is_released() {
            ConnectionState::Released
        } else {
            self.state
        }
    }

    /// Number of events returned by `next()`.
    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    /// Number of events written by `store()`.
    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    /// How long a blocking `next()` waits for data.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// How long `next()` waits for the segment named by a rotation marker.
    pub fn set_rotate_timeout(&mut self, timeout: Duration) {
        self.rotate_timeout = timeout;
    }

    pub fn set_read_filter<F>(&mut self, filter: F)
    where
        F: Fn(&EventHeader) -> bool + Send + Sync + 'static,
    {
        self.read_filter = Some(Box::new(filter));
    }

    pub fn clear_read_filter(&mut self) {
        self.read_filter = None;
    }

    /// Handle that cancels a blocking `next()` from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.signals.interrupt.clone()
    }

    fn assert_not_released(&self) -> ThlResult<()> {
        if self.signals.is_released() {
            return Err(ThlError::UseAfterRelease);
        }
        Ok(())
    }

    fn assert_writable(&self) -> ThlResult<()> {
        self.assert_not_released()?;
        if self.readonly {
            return Err(ThlError::NotWritable(format!(
                "connection {} is read-only",
                self.id
            )));
        }
        if !self.log.is_writable() {
            return Err(ThlError::NotWritable("log opened read-only".to_string()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cursor handling
    // -----------------------------------------------------------------------

    /// Check the cursor out of the manager, reopening it from the remembered
    /// position if it was evicted.
    fn take_cursor(&mut self, next_seqno: i64) -> ThlResult<Option<LogCursor>> {
        if let Some(cursor) = self.log.cursors.checkout(self.id, next_seqno)? {
            return Ok(Some(cursor));
        }
        let Some(position) = self.position.clone() else {
            return Ok(None);
        };
        if position.writable || next_seqno < position.last_seqno {
            return Ok(None);
        }
        let Some(log_file) = self
            .log
            .open_for_read(&position.file_name, &self.signals.interrupt)?
        else {
            return Err(ThlError::SegmentMissing {
                file: position.file_name,
                waited_ms: 0,
            });
        };
        log_file.seek_offset(position.offset);
        debug!(
            connection = %self.id,
            file = %position.file_name,
            offset = position.offset,
            "Reopened evicted THL cursor"
        );
        let mut cursor = LogCursor::new(Arc::new(log_file), position.last_seqno);
        cursor.set_rotate_next(position.rotate_next);
        Ok(Some(cursor))
    }

    /// Remember the cursor's position and park it.
    fn put_cursor(&mut self, cursor: LogCursor) {
        self.position = Some(CursorPosition {
            file_name: cursor.log_file().name().to_string(),
            offset: cursor.log_file().offset(),
            last_seqno: cursor.last_seqno(),
            rotate_next: cursor.rotate_next(),
            writable: cursor.log_file().mode() == OpenMode::Write,
        });
        self.log.cursors.checkin(self.id, cursor);
    }

    fn reset_position(&mut self) {
        self.log.cursors.discard_for(self.id);
        self.position = None;
        self.pending_event = None;
        self.pending_seqno = None;
    }

    fn materialize(&self, decoded: EventRecord<'_>) -> ThlResult<ThlEvent> {
        let wanted = self
            .read_filter
            .as_ref()
            .map_or(true, |filter| filter(&decoded.header));
        if wanted {
            decoded.into_event(self.log.serializer.as_ref())
        } else {
            Ok(decoded.into_header_event())
        }
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Position the connection at fragment `fragno` of `seqno`.
    ///
    /// Returns `true` when the fragment was found, or when the log ends just
    /// before it so that it will be the next event written. Returns `false`
    /// when the fragment is not in the log and cannot appear at the tail.
    /// `seek(FIRST, 0)` positions at the start of the oldest segment.
    pub fn seek(&mut self, seqno: i64, fragno: i16) -> ThlResult<bool> {
        self.assert_not_released()?;
        self.reset_position();

        let name = if seqno == FIRST && fragno == 0 {
            self.log.first_file()
        } else {
            self.log.file_for_seqno(seqno)
        };
        let Some(name) = name else {
            debug!(connection = %self.id, seqno, "Seqno is not in the THL index");
            return Ok(false);
        };
        let Some(log_file) = self.log.open_for_read(&name, &self.signals.interrupt)? else {
            return Ok(false);
        };

        let base_seqno = log_file.base_seqno();
        let mut cursor = LogCursor::new(Arc::new(log_file), seqno);
        cursor.set_rotate_next(true);

        if seqno == FIRST && fragno == 0 {
            self.put_cursor(cursor);
            self.state = ConnectionState::Positioned;
            return Ok(true);
        }

        let checksum = self.log.config.checksum;
        let target = (seqno, fragno);
        let mut next_expected = (base_seqno >= 0).then_some((base_seqno, 0));
        let found = loop {
            let record = cursor.log_file().read_record(Duration::ZERO)?;
            if record.is_empty() || self.log.is_hidden(&name, record.offset())? {
                cursor.log_file().seek_offset(record.offset());
                if next_expected.map_or(true, |expected| expected == target) {
                    self.pending_seqno = Some(seqno);
                    break true;
                }
                break false;
            }
            match record.record_type() {
                Some(RecordType::EventRepl) => {
                    let decoded = EventRecord::decode(&record, &name, checksum)?;
                    let at = (decoded.header.seqno, decoded.header.fragno);
                    if at == target {
                        self.pending_event = Some(self.materialize(decoded)?);
                        break true;
                    }
                    if at > target {
                        break false;
                    }
                    next_expected = Some(if decoded.header.last_frag {
                        (at.0 + 1, 0)
                    } else {
                        (at.0, at.1 + 1)
                    });
                }
                Some(RecordType::EventRotate) => break false,
                None => return Err(invalid_record_type(&name, &record)),
            }
        };

        if found {
            self.put_cursor(cursor);
            self.state = ConnectionState::Positioned;
        } else {
            cursor.release();
        }
        Ok(found)
    }

    /// Position at the start of segment `file_name` without following its
    /// rotation marker.
    pub fn seek_file(&mut self, file_name: &str) -> ThlResult<bool> {
        self.assert_not_released()?;
        self.reset_position();
        let Some(log_file) = self.log.open_for_read(file_name, &self.signals.interrupt)? else {
            return Ok(false);
        };
        let base_seqno = log_file.base_seqno();
        let mut cursor = LogCursor::new(Arc::new(log_file), base_seqno.max(FIRST));
        cursor.set_rotate_next(false);
        self.pending_seqno = (base_seqno >= 0).then_some(base_seqno);
        self.put_cursor(cursor);
        self.state = ConnectionState::Positioned;
        Ok(true)
    }

    /// Return the next event after the current position.
    ///
    /// With `block` set, waits up to the connection timeout for the writer to
    /// append; otherwise checks once. `None` means nothing is available yet.
    /// Rotation markers are followed into the next segment.
    pub fn next(&mut self, block: bool) -> ThlResult<Option<ThlEvent>> {
        self.assert_not_released()?;
        let Some(hint) = self.position.as_ref().map(|p| p.last_seqno) else {
            return Err(ThlError::NotPositioned);
        };
        let Some(mut cursor) = self.take_cursor(hint)? else {
            return Err(ThlError::NotPositioned);
        };
        if cursor.log_file().mode() == OpenMode::Write {
            self.log.cursors.discard(cursor);
            self.position = None;
            return Err(ThlError::NotPositioned);
        }
        let result = self.read_next(&mut cursor, block);
        self.put_cursor(cursor);
        result
    }

    fn read_next(&mut self, cursor: &mut LogCursor, block: bool) -> ThlResult<Option<ThlEvent>> {
        if let Some(event) = self.pending_event.take() {
            cursor.set_last_seqno(event.seqno);
            self.read_count += 1;
            self.state = ConnectionState::Reading;
            return Ok(Some(event));
        }

        let checksum = self.log.config.checksum;
        let timeout = if block { self.timeout } else { Duration::ZERO };
        let started = Instant::now();
        loop {
            let record = cursor.log_file().read_record(timeout)?;
            if record.is_empty() {
                return Ok(None);
            }
            let name = cursor.log_file().name().to_string();
            match record.record_type() {
                Some(RecordType::EventRepl) => {
                    if self.log.is_hidden(&name, record.offset())? {
                        cursor.log_file().seek_offset(record.offset());
                        if started.elapsed() >= timeout {
                            return Ok(None);
                        }
                        if self.signals.interrupt.take_interrupt() {
                            return Err(ThlError::Interrupted);
                        }
                        thread::sleep(self.log.config.read_poll_interval());
                        continue;
                    }
                    let decoded = EventRecord::decode(&record, &name, checksum)?;
                    if let Some(expected) = self.pending_seqno.take() {
                        if decoded.header.seqno != expected {
                            return Err(ThlError::LogPosition {
                                expected,
                                found: decoded.header.seqno,
                            });
                        }
                    }
                    let event = self.materialize(decoded)?;
                    cursor.set_last_seqno(event.seqno);
                    self.read_count += 1;
                    self.state = ConnectionState::Reading;
                    return Ok(Some(event));
                }
                Some(RecordType::EventRotate) => {
                    if !cursor.rotate_next() {
                        cursor.log_file().seek_offset(record.offset());
                        return Ok(None);
                    }
                    let next_name = data_file_name(decode_rotate(&record, &name, checksum)?);
                    let Some(next_file) = self.open_rotated(&next_name, block)? else {
                        cursor.log_file().seek_offset(record.offset());
                        return Ok(None);
                    };
                    debug!(connection = %self.id, from = %name, to = %next_name, "Following THL rotation");
                    let next_cursor = LogCursor::new(Arc::new(next_file), cursor.last_seqno());
                    mem::replace(cursor, next_cursor).release();
                }
                None => return Err(invalid_record_type(&name, &record)),
            }
        }
    }

    /// Open the segment a rotation marker names, waiting up to the rotate
    /// timeout for it when blocking.
    fn open_rotated(&self, name: &str, block: bool) -> ThlResult<Option<LogFile>> {
        let started = Instant::now();
        let poll = self.log.config.read_poll_interval();
        loop {
            if let Some(log_file) = self.log.open_for_read(name, &self.signals.interrupt)? {
                return Ok(Some(log_file));
            }
            if !block {
                return Ok(None);
            }
            if started.elapsed() >= self.rotate_timeout {
                return Err(ThlError::SegmentMissing {
                    file: name.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            if self.signals.interrupt.take_interrupt() {
                return Err(ThlError::Interrupted);
            }
            thread::sleep(poll);
        }
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Append an event fragment. When the tail segment has outgrown the size
    /// threshold and the event starts a new fragment chain, the log rotates
    /// first. With `commit` set the segment is flushed before returning.
    pub fn store(&mut self, event: &ThlEvent, commit: bool) -> ThlResult<()> {
        self.assert_writable()?;
        let mut cursor = match self.log.cursors.checkout(self.id, event.seqno)? {
            Some(cursor) if cursor.log_file().mode() == OpenMode::Write => cursor,
            Some(reader) => {
                self.log.cursors.discard(reader);
                self.open_write_cursor(event.seqno)?
            }
            None => self.open_write_cursor(event.seqno)?,
        };
        let result = self.write_event(&mut cursor, event, commit);
        self.put_cursor(cursor);
        result
    }

    fn open_write_cursor(&mut self, seqno: i64) -> ThlResult<LogCursor> {
        self.pending_event = None;
        self.pending_seqno = None;
        let log_file = match self.log.open_tail_for_write()? {
            Some(log_file) => log_file,
            None => self.log.start_new_log_file(seqno)?,
        };
        Ok(LogCursor::new(log_file, seqno))
    }

    fn write_event(&mut self, cursor: &mut LogCursor, event: &ThlEvent, commit: bool) -> ThlResult<()> {
        let config = &self.log.config;
        if event.fragno == 0 && cursor.log_file().length()? > config.log_file_size {
            let next = self.log.rotate(cursor.log_file(), event.seqno)?;
            *cursor = LogCursor::new(next, event.seqno);
        }

        let record = encode_event(event, self.log.serializer.as_ref(), config.checksum)?;
        cursor.log_file().write_record(&record, config.log_file_size)?;
        if event.last_frag {
            self.log.set_max_seqno(event.seqno);
        }
        if commit {
            cursor.log_file().flush()?;
        }
        cursor.set_last_seqno(event.seqno);
        self.write_count += 1;
        self.state = ConnectionState::Writing;
        Ok(())
    }

    /// Flush everything stored so far.
    pub fn commit(&mut self) -> ThlResult<()> {
        self.assert_writable()?;
        if let Some(cursor) = self.log.cursors.checkout(self.id, i64::MAX)? {
            let result = cursor.log_file().flush();
            self.put_cursor(cursor);
            result?;
        }
        Ok(())
    }

    /// Delete events in `[low, high]`. See [`DiskLog::delete`](crate::DiskLog::delete).
    pub fn delete(&mut self, low: Option<i64>, high: Option<i64>) -> ThlResult<()> {
        self.assert_writable()?;
        self.reset_position();
        self.log.delete(low, high)
    }

    /// Close the connection's segment and unregister it. Later calls fail
    /// with `UseAfterRelease`. Safe to call twice.
    pub fn release(&mut self) {
        if self.state == ConnectionState::Released {
            return;
        }
        self.signals.released.store(true, Ordering::SeqCst);
        self.log.cursors.discard_for(self.id);
        self.log.connections.unregister(self.id);
        self.position = None;
        self.pending_event = None;
        self.pending_seqno = None;
        self.state = ConnectionState::Released;
        info!(
            connection = %self.id,
            reads = self.read_count,
            writes = self.write_count,
            "Released THL connection"
        );
    }
}

impl Drop for LogConnection {
    fn drop(&mut self) {
        self.release();
    }
}

fn invalid_record_type(file: &str, record: &LogRecord) -> ThlError {
    ThlError::corruption(
        file,
        record.offset(),
        format!("invalid record type {:?}", record.type_byte()),
    )
}
