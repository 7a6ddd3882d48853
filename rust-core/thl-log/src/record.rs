// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Physical records
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// A `LogRecord` is one framed record inside a segment file. The framing is
// independent of what the record carries:
//
//   [4 bytes: record_length (u32 BE)]  -- length of the whole frame
//   [N bytes: data]                    -- data[0] is the record type
//   [1 byte:  crc_type]                -- 0=none, 1=CRC32
//   [4 bytes: crc (u32 BE)]            -- CRC32 of `data`, or 0
//
// Reads that find nothing at an offset return an *empty* record; reads that
// find an incomplete frame return a *truncated* record. Neither is an error.

use crc32fast::Hasher as Crc32Hasher;

use crate::error::{ThlError, ThlResult};

/// Number of framing bytes around the record data (length + crc type + crc).
pub const NON_DATA_BYTES: u32 = 4 + 1 + 4;

/// Largest record length accepted on read. Anything larger is treated as a
/// partially written or damaged frame.
pub const MAX_RECORD_LENGTH: u32 = 1_000_000_000;

// ---------------------------------------------------------------------------
// RecordType / CrcType
// ---------------------------------------------------------------------------

/// The kind of payload held in a record, stored as the first data byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// A replication event fragment.
    EventRepl = 0x01,
    /// A rotation marker naming the next segment.
    EventRotate = 0x02,
}

impl RecordType {
    /// Decode a record type byte. Returns `None` for unknown types.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::EventRepl),
            0x02 => Some(Self::EventRotate),
            _ => None,
        }
    }

    /// Encode this record type as a single byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Checksum algorithm recorded in the frame trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcType {
    None = 0,
    Crc32 = 1,
}

impl CrcType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Crc32),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// One physical record read from or destined for a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    offset: u64,
    data: Option<Vec<u8>>,
    crc_type: CrcType,
    crc: u32,
    truncated: bool,
}

impl LogRecord {
    /// A complete record read at `offset`.
    pub fn new(offset: u64, data: Vec<u8>, crc_type: CrcType, crc: u32) -> Self {
        Self {
            offset,
            data: Some(data),
            crc_type,
            crc,
            truncated: false,
        }
    }

    /// "No data present at this offset."
    pub fn empty(offset: u64) -> Self {
        Self {
            offset,
            data: None,
            crc_type: CrcType::None,
            crc: 0,
            truncated: false,
        }
    }

    /// An incomplete frame at `offset`. Also counts as empty.
    pub fn truncated(offset: u64) -> Self {
        Self {
            truncated: true,
            ..Self::empty(offset)
        }
    }

    /// Seal `data` into a record ready to be written, computing the CRC when
    /// `checksum` is set.
    pub fn sealed(data: Vec<u8>, checksum: bool) -> Self {
        let (crc_type, crc) = if checksum {
            (CrcType::Crc32, compute_crc32(&data))
        } else {
            (CrcType::None, 0)
        };
        Self::new(0, data, crc_type, crc)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Record data, or an empty slice for empty and truncated records.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn crc_type(&self) -> CrcType {
        self.crc_type
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// `true` when the read found no complete record.
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Raw type byte, if the record has data.
    pub fn type_byte(&self) -> Option<u8> {
        self.data.as_ref().and_then(|data| data.first().copied())
    }

    /// Decoded record type, if the record has data and a known type.
    pub fn record_type(&self) -> Option<RecordType> {
        self.type_byte().and_then(RecordType::from_byte)
    }

    /// Full on-disk length of this record including framing.
    pub fn record_length(&self) -> u32 {
        self.data().len() as u32 + NON_DATA_BYTES
    }

    /// Recompute the checksum and compare with the stored value. Records
    /// written without a checksum always pass.
    pub fn check_crc(&self) -> bool {
        match self.crc_type {
            CrcType::None => true,
            CrcType::Crc32 => compute_crc32(self.data()) == self.crc,
        }
    }

    /// Like [`check_crc`](Self::check_crc) but produces a `CrcMismatch`
    /// error naming `file`.
    pub fn verify_crc(&self, file: &str) -> ThlResult<()> {
        if self.check_crc() {
            return Ok(());
        }
        Err(ThlError::CrcMismatch {
            file: file.to_string(),
            offset: self.offset,
            stored: self.crc,
            computed: compute_crc32(self.data()),
        })
    }

    /// Encode the complete frame for writing.
    pub fn encode_frame(&self) -> Vec<u8> {
        let data = self.data();
        let mut frame = Vec::with_capacity(data.len() + NON_DATA_BYTES as usize);
        frame.extend_from_slice(&self.record_length().to_be_bytes());
        frame.extend_from_slice(data);
        frame.push(self.crc_type.to_byte());
        frame.extend_from_slice(&self.crc.to_be_bytes());
        frame
    }
}

/// Compute a CRC32 checksum over the given byte slice using the IEEE
/// polynomial (same as zlib/gzip).
pub fn compute_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ---------------------------------------------------------------------------
// RecordBuilder / RecordReader
// ---------------------------------------------------------------------------

/// Write cursor used to accumulate record data before sealing.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    buffer: Vec<u8>,
}

impl RecordBuilder {
    /// Start a record of the given type.
    pub fn new(record_type: RecordType) -> Self {
        let mut buffer = Vec::with_capacity(64);
        buffer.push(record_type.to_byte());
        Self { buffer }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn put_i16(&mut self, value: i16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a u16-length-prefixed UTF-8 string. Strings longer than
    /// `u16::MAX` bytes are rejected.
    pub fn put_str(&mut self, value: &str) -> ThlResult<&mut Self> {
        let length = u16::try_from(value.len()).map_err(|_| {
            ThlError::Serialization(format!(
                "string field of {} bytes exceeds {} byte limit",
                value.len(),
                u16::MAX
            ))
        })?;
        self.buffer.extend_from_slice(&length.to_be_bytes());
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(self)
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(value);
        self
    }

    /// Seal the accumulated data into a record.
    pub fn seal(self, checksum: bool) -> LogRecord {
        LogRecord::sealed(self.buffer, checksum)
    }
}

/// Read cursor over a record's data. Underflow is reported as corruption of
/// the record at `offset` in `file`.
pub struct RecordReader<'a> {
    data: &'a [u8],
    position: usize,
    file: &'a str,
    offset: u64,
}

impl<'a> RecordReader<'a> {
    /// Start reading `record` just after its type byte.
    pub fn new(record: &'a LogRecord, file: &'a str) -> Self {
        Self {
            data: record.data(),
            position: 1,
            file,
            offset: record.offset(),
        }
    }

    fn take(&mut self, count: usize) -> ThlResult<&'a [u8]> {
        let end = self.position.checked_add(count).filter(|end| *end <= self.data.len());
        let Some(end) = end else {
            return Err(ThlError::corruption(
                self.file,
                self.offset,
                format!(
                    "record data ends at {} bytes, needed {} more at position {}",
                    self.data.len(),
                    count,
                    self.position
                ),
            ));
        };
        let data = self.data;
        let slice = &data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> ThlResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn get_u8(&mut self) -> ThlResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_i16(&mut self) -> ThlResult<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> ThlResult<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> ThlResult<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_str(&mut self) -> ThlResult<String> {
        let length = u16::from_be_bytes(self.take_array()?) as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            ThlError::corruption(self.file, self.offset, format!("invalid UTF-8 in string field: {e}"))
        })
    }

    /// Everything not yet consumed.
    pub fn remaining(&mut self) -> &'a [u8] {
        let data = self.data;
        let rest = data.get(self.position..).unwrap_or_default();
        self.position = data.len();
        rest
    }
}
