// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - The logical log
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// `DiskLog` owns the ordered set of segments in a log directory. It recovers
// the tail on open, creates and rotates segments for the writer, deletes and
// purges old segments, and hands out connections. State shared with
// connections and the flush task lives in `LogShared`; the flush task
// thread itself is owned here so nothing points back at the log.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::{decode_rotate, encode_rotate, EventRecord};
use crate::config::DiskLogConfig;
use crate::connection::LogConnection;
use crate::connection_manager::LogConnectionManager;
use crate::cursor::{ConnectionId, LogCursorManager};
use crate::error::{ThlError, ThlResult};
use crate::flush::{FlushRegistry, Housekeeping, LogFlushTask};
use crate::index::{LogIndex, LogIndexEntry};
use crate::log_file::{InterruptHandle, LogFile};
use crate::record::RecordType;
use crate::segment::{
    data_file_name, list_data_files, parse_data_file_index, FIRST_FILE_INDEX, LOCK_FILE_NAME,
};
use crate::serializer::EventSerializer;
use crate::write_lock::WriteLock;

// ---------------------------------------------------------------------------
// LogShared
// ---------------------------------------------------------------------------

/// State shared by the log, its connections and the flush task.
pub(crate) struct LogShared {
    pub(crate) config: DiskLogConfig,
    pub(crate) serializer: Arc<dyn EventSerializer>,
    pub(crate) connections: LogConnectionManager,
    pub(crate) cursors: LogCursorManager,
    writable: bool,
    index: RwLock<LogIndex>,
    max_seqno: AtomicI64,
    active_seqno: Mutex<Option<i64>>,
    /// Index of the newest segment. Held while segments are created or
    /// deleted so those paths never interleave.
    file_index: Mutex<u32>,
    write_lock: Mutex<WriteLock>,
    registry: Arc<FlushRegistry>,
    next_connection_id: AtomicU64,
    /// Unterminated transaction left in place by a read-only open.
    hidden_tail: Mutex<Option<HiddenTail>>,
}

/// Records at or past `offset` in `file_name` are not readable until the
/// fragment chain starting there has its last fragment.
#[derive(Debug, Clone)]
struct HiddenTail {
    file_name: String,
    offset: u64,
}

impl LogShared {
    fn index(&self) -> RwLockReadGuard<'_, LogIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn index_mut(&self) -> RwLockWriteGuard<'_, LogIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn file_index(&self) -> MutexGuard<'_, u32> {
        self.file_index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn log_dir(&self) -> &Path {
        &self.config.log_dir
    }

    pub(crate) fn new_log_file(&self, name: &str) -> LogFile {
        configured_log_file(&self.config, name)
    }

    /// Segment to open when looking for `seqno`.
    pub(crate) fn file_for_seqno(&self, seqno: i64) -> Option<String> {
        self.index().file_for(seqno).map(str::to_string)
    }

    pub(crate) fn first_file(&self) -> Option<String> {
        self.index().first_file().map(str::to_string)
    }

    /// Open segment `name` for reading. `None` if it does not exist.
    pub(crate) fn open_for_read(
        &self,
        name: &str,
        interrupt: &InterruptHandle,
    ) -> ThlResult<Option<LogFile>> {
        let log_file = self.new_log_file(name).with_interrupt(interrupt.clone());
        match log_file.prepare_read() {
            Ok(()) => Ok(Some(log_file)),
            Err(ThlError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `true` when the record at `offset` in `file_name` belongs to an
    /// unterminated transaction found on a read-only open. Once the chain
    /// has been completed on disk the whole tail becomes readable.
    pub(crate) fn is_hidden(&self, file_name: &str, offset: u64) -> ThlResult<bool> {
        let mut hidden = self.hidden_tail.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tail) = hidden.as_ref() else {
            return Ok(false);
        };
        if tail.file_name != file_name || offset < tail.offset {
            return Ok(false);
        }
        if !chain_completes(&self.config, &tail.file_name, tail.offset)? {
            return Ok(true);
        }
        info!(
            file = %tail.file_name,
            offset = tail.offset,
            "Incomplete THL transaction has been completed"
        );
        *hidden = None;
        Ok(false)
    }

    /// Open the tail segment for appending and register it for flushing.
    /// `None` when the log has no segments.
    pub(crate) fn open_tail_for_write(&self) -> ThlResult<Option<Arc<LogFile>>> {
        let Some(name) = self.index().last_file().map(str::to_string) else {
            return Ok(None);
        };
        let log_file = Arc::new(self.new_log_file(&name));
        log_file.prepare_write(-1)?;
        self.registry.add(Arc::clone(&log_file));
        Ok(Some(log_file))
    }

    /// Create the next segment with base `seqno` and open it for appending.
    pub(crate) fn start_new_log_file(&self, seqno: i64) -> ThlResult<Arc<LogFile>> {
        let mut file_index = self.file_index();
        let log_file = self.create_next_file(&mut file_index, seqno)?;
        self.registry.add(Arc::clone(&log_file));
        Ok(log_file)
    }

    fn create_next_file(&self, file_index: &mut u32, seqno: i64) -> ThlResult<Arc<LogFile>> {
        let next_index = file_index
            .checked_add(1)
            .ok_or_else(|| ThlError::Consistency("segment index exhausted".to_string()))?;
        let name = data_file_name(next_index);
        let log_file = Arc::new(self.new_log_file(&name));
        if !log_file.prepare_write(seqno)? {
            log_file.release()?;
            return Err(ThlError::Consistency(format!(
                "new log file {name} exists already"
            )));
        }
        self.index_mut().add_new_file(seqno, name.as_str());
        *file_index = next_index;
        info!(file = %name, base_seqno = seqno, "Started new THL segment");
        Ok(log_file)
    }

    /// Close `current` with a rotation marker and open the next segment,
    /// whose first event will be `next_seqno`. The new segment exists before
    /// the marker is visible, so readers following the marker always find it.
    pub(crate) fn rotate(&self, current: &Arc<LogFile>, next_seqno: i64) -> ThlResult<Arc<LogFile>> {
        let next = {
            let mut file_index = self.file_index();
            let next = self.create_next_file(&mut file_index, next_seqno)?;
            current.write_record(&encode_rotate(*file_index, self.config.checksum), 0)?;
            self.registry.remove(current);
            current.release()?;
            self.registry.add(Arc::clone(&next));
            next
        };
        info!(
            from = %current.name(),
            to = %next.name(),
            next_seqno,
            "Rotated THL segment"
        );

        if let Err(e) = self.purge_expired() {
            warn!(error = %e, "Retention purge after rotation failed");
        }
        Ok(next)
    }

    pub(crate) fn max_seqno(&self) -> i64 {
        self.max_seqno.load(Ordering::SeqCst)
    }

    /// Record `seqno` as the highest complete seqno.
    pub(crate) fn set_max_seqno(&self, seqno: i64) {
        self.max_seqno.store(seqno, Ordering::SeqCst);
        self.index_mut().set_max_indexed_seqno(seqno);
    }

    /// Delete expired segments per the retention setting.
    pub(crate) fn purge_expired(&self) -> ThlResult<Vec<String>> {
        let Some(retention) = self.config.retention() else {
            return Ok(Vec::new());
        };
        if !self.writable {
            return Ok(Vec::new());
        }
        let active = *self.active_seqno.lock().unwrap_or_else(PoisonError::into_inner);
        self.index_mut().purge_expired(retention, active)
    }

    /// Delete events in `[low, high]`. See [`DiskLog::delete`].
    pub(crate) fn delete(&self, low: Option<i64>, high: Option<i64>) -> ThlResult<()> {
        if !self.writable {
            return Err(ThlError::NotWritable("log opened read-only".to_string()));
        }
        let _file_index = self.file_index();
        let mut index = self.index_mut();
        if index.is_empty() {
            return Ok(());
        }

        let min = index.min_indexed_seqno();
        let max = self.max_seqno();
        let low = low.unwrap_or(min);
        let high = high.unwrap_or(max);
        let includes_min = low <= min;
        let includes_max = high >= max;
        if low > high || !(includes_min || includes_max) {
            return Err(ThlError::InvalidDeleteRange { low, high });
        }

        let mut deleted = 0usize;
        for entry in index.entries() {
            if entry.start_seqno >= low && entry.end_seqno <= high {
                fs::remove_file(self.log_dir().join(&entry.file_name))?;
                index.remove_file(&entry.file_name);
                deleted += 1;
                debug!(file = %entry.file_name, "Deleted THL segment");
            } else if includes_max && entry.start_seqno < low && entry.end_seqno >= low {
                self.truncate_from(&entry, low)?;
            }
        }

        if includes_max {
            let new_max = if index.is_empty() { -1 } else { (low - 1).min(max) };
            self.max_seqno.store(new_max, Ordering::SeqCst);
            index.set_max_indexed_seqno(new_max);
            if let Some(tail) = index.last_file().map(str::to_string) {
                self.strip_rotate_marker(&tail)?;
            }
        }
        info!(low, high, deleted, remaining = index.len(), "Deleted THL events");
        Ok(())
    }

    /// Cut `entry`'s segment at the first event with seqno >= `low`.
    fn truncate_from(&self, entry: &LogIndexEntry, low: i64) -> ThlResult<()> {
        let reader = self.new_log_file(&entry.file_name);
        reader.prepare_read()?;
        let cut = loop {
            let record = reader.read_record(Duration::ZERO)?;
            if record.is_empty() {
                break None;
            }
            if record.record_type() == Some(RecordType::EventRepl) {
                let header = EventRecord::decode(&record, &entry.file_name, false)?.header;
                if header.seqno >= low {
                    break Some(record.offset());
                }
            }
        };
        reader.release()?;

        if let Some(offset) = cut {
            self.truncate_file(&entry.file_name, offset)?;
            info!(file = %entry.file_name, offset, low, "Truncated THL segment");
        }
        Ok(())
    }

    /// Remove a trailing rotation marker so the writer can append in place.
    fn strip_rotate_marker(&self, name: &str) -> ThlResult<()> {
        let reader = self.new_log_file(name);
        reader.prepare_read()?;
        let marker = loop {
            let record = reader.read_record(Duration::ZERO)?;
            if record.is_empty() {
                break None;
            }
            if record.record_type() == Some(RecordType::EventRotate) {
                break Some(record.offset());
            }
        };
        reader.release()?;
        if let Some(offset) = marker {
            self.truncate_file(name, offset)?;
        }
        Ok(())
    }

    fn truncate_file(&self, name: &str, length: u64) -> ThlResult<()> {
        let writer = self.new_log_file(name);
        writer.prepare_write(-1)?;
        writer.set_length(length)?;
        writer.release()
    }

    fn housekeeping(&self) {
        let evicted = self.cursors.sweep_idle();
        if evicted > 0 {
            debug!(evicted, "Evicted idle THL cursors");
        }
        if let Err(e) = self.purge_expired() {
            error!(error = %e, "THL retention purge failed");
        }
    }
}

fn configured_log_file(config: &DiskLogConfig, name: &str) -> LogFile {
    LogFile::new(&config.log_dir, name)
        .with_buffer_size(config.buffer_size)
        .with_poll_interval(config.read_poll_interval())
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// What a forward scan of the tail segment found.
struct TailScan {
    base_seqno: i64,
    max_seqno: i64,
    complete_events: usize,
    /// Offset just past the last complete fragment chain or rotation marker.
    complete_offset: u64,
    truncated_record: bool,
    open_chain: bool,
    rotate_to: Option<u32>,
}

fn scan_tail(config: &DiskLogConfig, name: &str) -> ThlResult<TailScan> {
    let log_file = configured_log_file(config, name);
    log_file.prepare_read()?;
    let base_seqno = log_file.base_seqno();
    let mut scan = TailScan {
        base_seqno,
        max_seqno: if base_seqno >= 0 { base_seqno - 1 } else { -1 },
        complete_events: 0,
        complete_offset: log_file.offset(),
        truncated_record: false,
        open_chain: false,
        rotate_to: None,
    };

    loop {
        let record = log_file.read_record(Duration::ZERO)?;
        if record.is_empty() {
            scan.truncated_record = record.is_truncated();
            break;
        }
        match record.record_type() {
            Some(RecordType::EventRepl) => {
                let header = EventRecord::decode(&record, name, config.checksum)?.header;
                if header.last_frag {
                    scan.max_seqno = header.seqno;
                    scan.complete_events += 1;
                    scan.complete_offset = log_file.offset();
                    scan.open_chain = false;
                } else {
                    scan.open_chain = true;
                }
            }
            Some(RecordType::EventRotate) => {
                scan.rotate_to = Some(decode_rotate(&record, name, config.checksum)?);
                scan.complete_offset = log_file.offset();
                break;
            }
            None => {
                return Err(ThlError::corruption(
                    name,
                    record.offset(),
                    format!("invalid record type {:?}", record.type_byte()),
                ));
            }
        }
    }
    log_file.release()?;
    Ok(scan)
}

// ---------------------------------------------------------------------------
// DiskLog
// ---------------------------------------------------------------------------

/// A segmented, append-only transaction history log in one directory.
///
/// One writer connection and any number of reader connections may be open
/// at a time. Dropping the log releases it.
pub struct DiskLog {
    shared: Arc<LogShared>,
    flush_task: Mutex<Option<LogFlushTask>>,
    released: AtomicBool,
}

impl DiskLog {
    /// Open the log described by `config`, creating it when writable, and
    /// recover the tail segment.
    ///
    /// Recovery finds the highest seqno whose fragment chain is complete.
    /// A partially written record or unterminated chain after it is cut off
    /// when the log is writable. A read-only open leaves the bytes in place
    /// and hides them from readers until the chain is completed.
    pub fn prepare(config: DiskLogConfig) -> ThlResult<Self> {
        config.validate()?;
        let log_dir = config.log_dir.clone();
        let writable = !config.read_only;
        info!(
            dir = %log_dir.display(),
            writable,
            checksum = config.checksum,
            serializer = %config.serializer,
            "Preparing THL disk log"
        );

        if !log_dir.exists() {
            if !writable {
                return Err(ThlError::NotFound(log_dir.display().to_string()));
            }
            fs::create_dir_all(&log_dir)?;
            info!(dir = %log_dir.display(), "Created THL log directory");
        } else if !log_dir.is_dir() {
            return Err(ThlError::Io(io::Error::other(format!(
                "{} is not a directory",
                log_dir.display()
            ))));
        }

        let mut write_lock = WriteLock::new(log_dir.join(LOCK_FILE_NAME));
        if writable && !write_lock.acquire()? {
            return Err(ThlError::WriteLockHeld(write_lock.path().to_path_buf()));
        }

        let mut files = list_data_files(&log_dir)?;
        if files.is_empty() {
            if !writable {
                return Err(ThlError::NotFound(format!(
                    "no THL segments in {}",
                    log_dir.display()
                )));
            }
            let name = data_file_name(FIRST_FILE_INDEX);
            let first = configured_log_file(&config, &name);
            first.prepare_write(-1)?;
            first.release()?;
            info!(file = %name, "Initialized new THL log");
            files.push(name);
        }

        let mut index = LogIndex::build(&log_dir, &files)?;
        let tail = files.last().cloned().unwrap_or_default();
        let mut file_index = parse_data_file_index(&tail).unwrap_or(FIRST_FILE_INDEX);
        let (max_seqno, hidden_tail) =
            recover_tail(&config, &tail, writable, &mut index, &mut file_index)?;

        let registry = Arc::new(FlushRegistry::new());
        let shared = Arc::new(LogShared {
            serializer: config.serializer.build(),
            connections: LogConnectionManager::new(),
            cursors: LogCursorManager::new(config.connection_timeout(), Arc::clone(&registry)),
            writable,
            index: RwLock::new(index),
            max_seqno: AtomicI64::new(max_seqno),
            active_seqno: Mutex::new(None),
            file_index: Mutex::new(file_index),
            write_lock: Mutex::new(write_lock),
            registry: Arc::clone(&registry),
            next_connection_id: AtomicU64::new(1),
            hidden_tail: Mutex::new(hidden_tail),
            config,
        });

        let housekeeper = Arc::clone(&shared);
        let housekeeping: Housekeeping = Box::new(move || housekeeper.housekeeping());
        let flush_task = LogFlushTask::start(
            shared.config.flush_interval(),
            registry,
            Some(housekeeping),
        )?;

        info!(
            dir = %log_dir.display(),
            files = shared.index().len(),
            max_seqno,
            "THL disk log ready"
        );
        Ok(Self {
            shared,
            flush_task: Mutex::new(Some(flush_task)),
            released: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DiskLogConfig {
        &self.shared.config
    }

    pub fn log_dir(&self) -> &Path {
        self.shared.log_dir()
    }

    /// `true` when this instance holds the write lock.
    pub fn is_writable(&self) -> bool {
        self.shared.writable
    }

    /// Highest fully committed seqno, or -1 for an empty log.
    pub fn get_max_seqno(&self) -> i64 {
        self.shared.max_seqno()
    }

    /// Lowest seqno still in the log, or -1 for an empty log.
    pub fn get_min_seqno(&self) -> i64 {
        self.shared.index().min_indexed_seqno()
    }

    /// Override the recorded maximum seqno.
    pub fn set_max_seqno(&self, seqno: i64) {
        self.shared.set_max_seqno(seqno);
    }

    /// Number of segment files.
    pub fn file_count(&self) -> usize {
        self.shared.index().len()
    }

    /// Snapshot of the segment index, oldest first.
    pub fn index_entries(&self) -> Vec<LogIndexEntry> {
        self.shared.index().entries()
    }

    /// Check that segment files exist and their seqno ranges are gap-free.
    pub fn validate(&self) -> ThlResult<()> {
        self.shared.index().validate()
    }

    /// Keep segments holding `seqno` or later from being purged by
    /// retention. `None` lifts the restriction.
    pub fn set_active_seqno(&self, seqno: Option<i64>) {
        *self
            .shared
            .active_seqno
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = seqno;
    }

    /// Run the retention purge now. Returns the deleted segment names.
    pub fn purge_expired(&self) -> ThlResult<Vec<String>> {
        self.shared.purge_expired()
    }

    /// Open a connection. At most one writable connection may be live.
    pub fn create_connection(&self, readonly: bool) -> ThlResult<LogConnection> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ThlError::LogClosed);
        }
        let id = ConnectionId(self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst));
        LogConnection::open(Arc::clone(&self.shared), id, readonly)
    }

    /// Delete events in `[low, high]`; `None` bounds default to the log's
    /// minimum and maximum. The range must touch one end of the log. Whole
    /// segments inside the range are removed and a segment straddling `low`
    /// is truncated. Refused while a writer connection is live; use
    /// [`LogConnection::delete`] from the writer instead.
    pub fn delete(&self, low: Option<i64>, high: Option<i64>) -> ThlResult<()> {
        if !self.shared.writable {
            return Err(ThlError::NotWritable("log opened read-only".to_string()));
        }
        if let Some(holder) = self.shared.connections.writer() {
            return Err(ThlError::AlreadyWriting { holder: holder.0 });
        }
        self.shared.delete(low, high)
    }

    /// Stop the flush task, flush and close every segment, release all
    /// connections and give up the write lock. Safe to call twice.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut task) = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.cancel();
        }
        if let Err(e) = self.shared.registry.flush_all() {
            error!(error = %e, "Final THL flush failed");
        }
        self.shared.connections.release_all();
        self.shared.cursors.release();
        self.shared
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
        info!(dir = %self.log_dir().display(), "Released THL disk log");
    }
}

impl Drop for DiskLog {
    fn drop(&mut self) {
        self.release();
    }
}

fn recover_tail(
    config: &DiskLogConfig,
    tail: &str,
    writable: bool,
    index: &mut LogIndex,
    file_index: &mut u32,
) -> ThlResult<(i64, Option<HiddenTail>)> {
    let scan = scan_tail(config, tail)?;

    let mut hidden = None;
    if scan.truncated_record || scan.open_chain {
        if writable {
            let writer = configured_log_file(config, tail);
            writer.prepare_write(-1)?;
            writer.set_length(scan.complete_offset)?;
            writer.release()?;
            info!(
                file = %tail,
                offset = scan.complete_offset,
                max_seqno = scan.max_seqno,
                "Truncated incomplete transaction from THL tail"
            );
        } else {
            warn!(
                file = %tail,
                offset = scan.complete_offset,
                max_seqno = scan.max_seqno,
                "THL tail ends with an incomplete transaction; hiding it on read-only open"
            );
            hidden = Some(HiddenTail {
                file_name: tail.to_string(),
                offset: scan.complete_offset,
            });
        }
    }

    if scan.complete_events == 0 && scan.base_seqno < 0 {
        index.reset_tail(-1);
    }
    index.set_max_indexed_seqno(scan.max_seqno);

    if let Some(next_index) = scan.rotate_to {
        if writable {
            let name = data_file_name(next_index);
            let next = configured_log_file(config, &name);
            next.prepare_write(scan.max_seqno + 1)?;
            next.release()?;
            index.add_new_file(scan.max_seqno + 1, name.as_str());
            *file_index = next_index;
            info!(file = %name, "THL tail ended with a rotation marker; started next segment");
        }
    }
    Ok((scan.max_seqno, hidden))
}

/// `true` when the fragment chain starting at `offset` in `name` has been
/// written through its last fragment.
fn chain_completes(config: &DiskLogConfig, name: &str, offset: u64) -> ThlResult<bool> {
    let log_file = configured_log_file(config, name);
    log_file.prepare_read()?;
    log_file.seek_offset(offset);
    let mut completed = false;
    loop {
        let record = log_file.read_record(Duration::ZERO)?;
        if record.record_type() != Some(RecordType::EventRepl) {
            break;
        }
        if EventRecord::decode(&record, name, false)?.header.last_frag {
            completed = true;
            break;
        }
    }
    log_file.release()?;
    Ok(completed)
}
