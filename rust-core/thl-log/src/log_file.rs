// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Segment files
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `LogFile` wraps one segment on disk. A segment opened for writing appends
// framed records through a buffered writer; a segment opened for reading owns
// its own descriptor and read position, so readers never share state with
// the writer or with each other.
//
// Segment header (big-endian):
//   [4 bytes: magic 0xC001CAFE]
//   [2 bytes: major version]
//   [2 bytes: minor version]
//   [8 bytes: base seqno (i64), -1 for the first segment of a new log]

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ThlError, ThlResult};
use crate::record::{CrcType, LogRecord, MAX_RECORD_LENGTH, NON_DATA_BYTES};

/// Segment file magic number.
pub const MAGIC_NUMBER: u32 = 0xC001_CAFE;

/// Incompatible format changes bump the major version.
pub const MAJOR_VERSION: u16 = 1;

/// Compatible format changes bump the minor version.
pub const MINOR_VERSION: u16 = 1;

/// Size of the segment header in bytes.
pub const FILE_HEADER_SIZE: u64 = 16;

/// Default capacity of the writer's buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Default sleep between checks in a blocking read.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// InterruptHandle
// ---------------------------------------------------------------------------

/// Cancels blocking reads from another thread.
///
/// An interrupt is consumed by the read it cancels; later reads block again.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the current or next blocking read.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending interrupt, returning whether there was one.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// LogFile
// ---------------------------------------------------------------------------

/// How a segment is currently open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Closed,
    ReadOnly,
    Write,
}

enum Handle {
    Closed,
    Reader(File),
    Writer(BufWriter<File>),
}

struct FileState {
    handle: Handle,
    base_seqno: i64,
    /// Bytes written so far (writer only).
    length: u64,
    /// Offset of the next record to read (reader only).
    position: u64,
}

/// One segment of the log.
pub struct LogFile {
    path: PathBuf,
    name: String,
    buffer_size: usize,
    poll_interval: Duration,
    interrupt: Option<InterruptHandle>,
    state: Mutex<FileState>,
}

impl LogFile {
    /// Describe segment `name` in `log_dir`. Nothing is opened until
    /// [`prepare_read`](Self::prepare_read) or
    /// [`prepare_write`](Self::prepare_write).
    pub fn new(log_dir: &Path, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: log_dir.join(&name),
            name,
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            interrupt: None,
            state: Mutex::new(FileState {
                handle: Handle::Closed,
                base_seqno: -1,
                length: 0,
                position: 0,
            }),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Let `interrupt` cancel blocking reads on this segment.
    pub fn with_interrupt(mut self, interrupt: InterruptHandle) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base seqno from the segment header. Only meaningful once prepared.
    pub fn base_seqno(&self) -> i64 {
        self.lock().base_seqno
    }

    pub fn mode(&self) -> OpenMode {
        match self.lock().handle {
            Handle::Closed => OpenMode::Closed,
            Handle::Reader(_) => OpenMode::ReadOnly,
            Handle::Writer(_) => OpenMode::Write,
        }
    }

    /// Open or create the segment for appending. A new segment gets a header
    /// carrying `base_seqno`; an existing one keeps its own. Returns `true`
    /// when the file was created.
    pub fn prepare_write(&self, base_seqno: i64) -> ThlResult<bool> {
        let created = !self.path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let base_seqno = if file.metadata()?.len() == 0 {
            write_header(&mut file, base_seqno)?;
            file.sync_data()?;
            debug!(file = %self.name, base_seqno, "Created THL segment");
            base_seqno
        } else {
            self.read_header(&mut file)?
        };
        let length = file.seek(SeekFrom::End(0))?;

        let mut state = self.lock();
        state.handle = Handle::Writer(BufWriter::with_capacity(self.buffer_size, file));
        state.base_seqno = base_seqno;
        state.length = length;
        state.position = length;
        Ok(created)
    }

    /// Open an existing segment for reading, positioned at the first record.
    pub fn prepare_read(&self) -> ThlResult<()> {
        let mut file = File::open(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ThlError::NotFound(self.path.display().to_string()),
            _ => ThlError::Io(e),
        })?;
        let base_seqno = self.read_header(&mut file)?;

        let mut state = self.lock();
        state.handle = Handle::Reader(file);
        state.base_seqno = base_seqno;
        state.position = FILE_HEADER_SIZE;
        Ok(())
    }

    fn read_header(&self, file: &mut File) -> ThlResult<i64> {
        if file.metadata()?.len() < FILE_HEADER_SIZE {
            return Err(ThlError::corruption(&self.name, 0, "segment header is incomplete"));
        }
        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC_NUMBER {
            return Err(ThlError::corruption(
                &self.name,
                0,
                format!("bad magic number {magic:#010x}"),
            ));
        }
        let major = u16::from_be_bytes([header[4], header[5]]);
        if major != MAJOR_VERSION {
            return Err(ThlError::corruption(
                &self.name,
                0,
                format!("major version {major} is not supported (expected {MAJOR_VERSION})"),
            ));
        }
        let minor = u16::from_be_bytes([header[6], header[7]]);
        if minor != MINOR_VERSION {
            warn!(
                file = %self.name,
                found = minor,
                expected = MINOR_VERSION,
                "Segment minor version differs"
            );
        }
        let mut base = [0u8; 8];
        base.copy_from_slice(&header[8..16]);
        Ok(i64::from_be_bytes(base))
    }

    /// Append a sealed record. Returns `true` when the segment has grown past
    /// `size_threshold` bytes (0 disables the check). Data is not visible to
    /// readers or durable until [`flush`](Self::flush).
    pub fn write_record(&self, record: &LogRecord, size_threshold: u64) -> ThlResult<bool> {
        let frame = record.encode_frame();
        let mut state = self.lock();
        let Handle::Writer(writer) = &mut state.handle else {
            return Err(ThlError::NotWritable(format!("{} is not open for writing", self.name)));
        };
        writer.write_all(&frame)?;
        state.length += frame.len() as u64;
        Ok(size_threshold > 0 && state.length > size_threshold)
    }

    /// Read the record at the current position, waiting up to `timeout` for
    /// it to appear. A zero timeout checks once without blocking.
    ///
    /// Returns an empty record when nothing is there and a truncated record
    /// when only part of a frame is present; the position is left unchanged
    /// in both cases.
    pub fn read_record(&self, timeout: Duration) -> ThlResult<LogRecord> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        let offset = state.position;
        let Handle::Reader(file) = &mut state.handle else {
            return Err(ThlError::Io(io::Error::other(format!(
                "{} is not open for reading",
                self.name
            ))));
        };

        if !self.wait_for_data(file, offset, 4, deadline)? {
            return partial_or_empty(file, offset);
        }

        let mut length_bytes = [0u8; 4];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut length_bytes)?;
        let record_length = u32::from_be_bytes(length_bytes);
        if !(NON_DATA_BYTES..=MAX_RECORD_LENGTH).contains(&record_length) {
            warn!(
                file = %self.name,
                offset,
                record_length,
                "Record length out of range, treating as truncated"
            );
            return Ok(LogRecord::truncated(offset));
        }

        if !self.wait_for_data(file, offset, u64::from(record_length), deadline)? {
            return Ok(LogRecord::truncated(offset));
        }

        let mut body = vec![0u8; record_length as usize - 4];
        file.read_exact(&mut body)?;
        let crc_start = body.len() - 4;
        let crc = u32::from_be_bytes([
            body[crc_start],
            body[crc_start + 1],
            body[crc_start + 2],
            body[crc_start + 3],
        ]);
        let crc_byte = body[crc_start - 1];
        let Some(crc_type) = CrcType::from_byte(crc_byte) else {
            return Err(ThlError::corruption(
                &self.name,
                offset,
                format!("unknown CRC type {crc_byte}"),
            ));
        };
        body.truncate(crc_start - 1);

        state.position = offset + u64::from(record_length);
        Ok(LogRecord::new(offset, body, crc_type, crc))
    }

    fn wait_for_data(
        &self,
        file: &File,
        offset: u64,
        needed: u64,
        deadline: Option<Instant>,
    ) -> ThlResult<bool> {
        loop {
            if available(file, offset)? >= needed {
                return Ok(true);
            }
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if deadline <= now => return Ok(false),
                Some(deadline) => deadline - now,
                None => self.poll_interval,
            };
            if self.interrupt.as_ref().is_some_and(InterruptHandle::take_interrupt) {
                return Err(ThlError::Interrupted);
            }
            thread::sleep(remaining.min(self.poll_interval));
        }
    }

    /// Flush buffered bytes and sync them to disk. No-op unless writing.
    pub fn flush(&self) -> ThlResult<()> {
        let mut state = self.lock();
        if let Handle::Writer(writer) = &mut state.handle {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Cut the segment back to `length` bytes. Writer only.
    pub fn set_length(&self, length: u64) -> ThlResult<()> {
        let mut state = self.lock();
        let Handle::Writer(writer) = &mut state.handle else {
            return Err(ThlError::NotWritable(format!("{} is not open for writing", self.name)));
        };
        writer.flush()?;
        writer.get_ref().set_len(length)?;
        writer.seek(SeekFrom::Start(length))?;
        writer.get_ref().sync_data()?;
        state.length = length;
        Ok(())
    }

    /// Current length: bytes written for a writer, bytes on disk otherwise.
    pub fn length(&self) -> ThlResult<u64> {
        let state = self.lock();
        match &state.handle {
            Handle::Writer(_) => Ok(state.length),
            Handle::Reader(file) => Ok(file.metadata()?.len()),
            Handle::Closed => Ok(std::fs::metadata(&self.path)?.len()),
        }
    }

    /// Offset of the next record to read.
    pub fn offset(&self) -> u64 {
        self.lock().position
    }

    /// Move the read position. The caller guarantees `offset` is a record
    /// boundary.
    pub fn seek_offset(&self, offset: u64) {
        self.lock().position = offset;
    }

    /// Flush if writing, then close the descriptor.
    pub fn release(&self) -> ThlResult<()> {
        let mut state = self.lock();
        let handle = std::mem::replace(&mut state.handle, Handle::Closed);
        if let Handle::Writer(mut writer) = handle {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .finish()
    }
}

fn available(file: &File, offset: u64) -> ThlResult<u64> {
    Ok(file.metadata()?.len().saturating_sub(offset))
}

fn partial_or_empty(file: &File, offset: u64) -> ThlResult<LogRecord> {
    if available(file, offset)? > 0 {
        Ok(LogRecord::truncated(offset))
    } else {
        Ok(LogRecord::empty(offset))
    }
}

fn write_header(file: &mut File, base_seqno: i64) -> io::Result<()> {
    let mut header = Vec::with_capacity(FILE_HEADER_SIZE as usize);
    header.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
    header.extend_from_slice(&MAJOR_VERSION.to_be_bytes());
    header.extend_from_slice(&MINOR_VERSION.to_be_bytes());
    header.extend_from_slice(&base_seqno.to_be_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)
}
