// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Segment index
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Maps seqno ranges to segment files. Built from segment headers when the
// log is prepared and maintained by the writer path afterwards. The tail
// entry's end tracks the highest complete seqno; a fresh entry starts empty
// with `end_seqno == start_seqno - 1`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::EventRecord;
use crate::error::{ThlError, ThlResult};
use crate::log_file::LogFile;
use crate::record::RecordType;

/// Segments always kept by retention, whatever their age.
pub const MIN_RETAINED_FILES: usize = 2;

/// One segment and the seqno range it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogIndexEntry {
    /// First seqno in the segment, or -1 before the first event is written.
    pub start_seqno: i64,
    /// Last complete seqno; `start_seqno - 1` while the segment is empty.
    pub end_seqno: i64,
    /// Segment file name, relative to the log directory.
    pub file_name: String,
}

impl LogIndexEntry {
    pub fn new(start_seqno: i64, end_seqno: i64, file_name: impl Into<String>) -> Self {
        Self {
            start_seqno,
            end_seqno,
            file_name: file_name.into(),
        }
    }

    /// `true` when `seqno` falls inside this entry's range.
    pub fn contains(&self, seqno: i64) -> bool {
        self.start_seqno <= seqno && seqno <= self.end_seqno
    }
}

impl fmt::Display for LogIndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}..{}]",
            self.file_name, self.start_seqno, self.end_seqno
        )
    }
}

/// Ordered index of all segments in a log directory.
#[derive(Debug)]
pub struct LogIndex {
    log_dir: PathBuf,
    entries: Vec<LogIndexEntry>,
}

impl LogIndex {
    /// An index with no segments.
    pub fn empty(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            entries: Vec::new(),
        }
    }

    /// Build the index from segment headers. `file_names` must be sorted by
    /// segment index. A base seqno of -1 is resolved from the first record.
    pub fn build(log_dir: &Path, file_names: &[String]) -> ThlResult<Self> {
        let mut index = Self::empty(log_dir);
        for name in file_names {
            let log_file = LogFile::new(log_dir, name.as_str());
            log_file.prepare_read()?;
            let mut start_seqno = log_file.base_seqno();
            if start_seqno < 0 {
                let record = log_file.read_record(Duration::ZERO)?;
                if record.record_type() == Some(RecordType::EventRepl) {
                    start_seqno = EventRecord::decode(&record, name, false)?.header.seqno;
                }
            }
            log_file.release()?;

            if let Some(previous) = index.entries.last_mut() {
                previous.end_seqno = start_seqno - 1;
            }
            index
                .entries
                .push(LogIndexEntry::new(start_seqno, i64::MAX, name.as_str()));
        }
        debug!(entries = index.entries.len(), "Built THL index");
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<LogIndexEntry> {
        self.entries.clone()
    }

    pub fn first_file(&self) -> Option<&str> {
        self.entries.first().map(|e| e.file_name.as_str())
    }

    pub fn last_file(&self) -> Option<&str> {
        self.entries.last().map(|e| e.file_name.as_str())
    }

    /// Lowest seqno held, or -1 if the log holds nothing.
    pub fn min_indexed_seqno(&self) -> i64 {
        match self.entries.first() {
            Some(first) if first.start_seqno >= 0 && first.start_seqno <= self.max_indexed_seqno() => {
                first.start_seqno
            }
            _ => -1,
        }
    }

    /// Highest complete seqno held, or -1 if the log holds nothing.
    pub fn max_indexed_seqno(&self) -> i64 {
        match self.entries.last() {
            Some(last) if last.start_seqno >= 0 => last.end_seqno,
            _ => -1,
        }
    }

    /// Record `seqno` as the tail's highest complete seqno. An uninitialized
    /// tail takes it as its start.
    pub fn set_max_indexed_seqno(&mut self, seqno: i64) {
        if let Some(last) = self.entries.last_mut() {
            if last.start_seqno < 0 && seqno >= 0 {
                last.start_seqno = seqno;
            }
            last.end_seqno = seqno;
        }
    }

    /// Mark the tail as holding no events yet.
    pub fn reset_tail(&mut self, start_seqno: i64) {
        if let Some(last) = self.entries.last_mut() {
            last.start_seqno = start_seqno;
            last.end_seqno = if start_seqno < 0 { -1 } else { start_seqno - 1 };
        }
    }

    /// Name of the segment to open when looking for `seqno`: the segment
    /// containing it, or the tail for seqnos not yet written. `None` for
    /// negative seqnos and seqnos that were purged.
    pub fn file_for(&self, seqno: i64) -> Option<&str> {
        let first = self.entries.first()?;
        if seqno < 0 {
            return None;
        }
        if first.start_seqno < 0 {
            return Some(first.file_name.as_str());
        }
        if seqno < first.start_seqno {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.contains(seqno))
            .or(self.entries.last())
            .map(|entry| entry.file_name.as_str())
    }

    /// Append a new, empty tail segment starting at `start_seqno`.
    pub fn add_new_file(&mut self, start_seqno: i64, file_name: impl Into<String>) {
        let entry = LogIndexEntry::new(start_seqno, start_seqno - 1, file_name);
        debug!(entry = %entry, "Adding THL index entry");
        self.entries.push(entry);
    }

    /// Drop the entry for `file_name`. Returns `true` if it was present.
    pub fn remove_file(&mut self, file_name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.file_name != file_name);
        before != self.entries.len()
    }

    /// Delete expired segments from the oldest end. A segment is expired when
    /// its modification time is older than `retention` and it holds nothing
    /// at or after `active_seqno`. The last [`MIN_RETAINED_FILES`] segments
    /// are always kept and the purge stops at the first segment still in use.
    /// Returns the names of deleted segments.
    pub fn purge_expired(
        &mut self,
        retention: Duration,
        active_seqno: Option<i64>,
    ) -> ThlResult<Vec<String>> {
        let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
            return Ok(Vec::new());
        };
        let mut purged = Vec::new();
        while self.entries.len() > MIN_RETAINED_FILES {
            let oldest = &self.entries[0];
            if active_seqno.is_some_and(|active| oldest.end_seqno >= active) {
                break;
            }
            let path = self.log_dir.join(&oldest.file_name);
            let modified = fs::metadata(&path)?.modified()?;
            if modified > cutoff {
                break;
            }
            fs::remove_file(&path)?;
            let removed = self.entries.remove(0);
            info!(file = %removed.file_name, end_seqno = removed.end_seqno, "Purged expired THL segment");
            purged.push(removed.file_name);
        }
        Ok(purged)
    }

    /// Check that every segment exists and the seqno ranges are ordered and
    /// gap-free.
    pub fn validate(&self) -> ThlResult<()> {
        let mut previous: Option<&LogIndexEntry> = None;
        for entry in &self.entries {
            if !self.log_dir.join(&entry.file_name).exists() {
                return Err(ThlError::Consistency(format!(
                    "indexed file {} does not exist",
                    entry.file_name
                )));
            }
            if entry.start_seqno > entry.end_seqno + 1 {
                return Err(ThlError::Consistency(format!(
                    "start seqno exceeds end seqno: {entry}"
                )));
            }
            if let Some(previous) = previous {
                if previous.end_seqno + 1 != entry.start_seqno {
                    warn!(previous = %previous, next = %entry, "THL index gap");
                    return Err(ThlError::Consistency(format!(
                        "seqno gap between {previous} and {entry}"
                    )));
                }
            }
            previous = Some(entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_event;
    use crate::event::ThlEvent;
    use crate::segment::data_file_name;
    use crate::serializer::SerializerKind;
    use tempfile::TempDir;

    fn write_segment(dir: &Path, index: u32, base: i64, seqnos: &[i64]) -> String {
        let name = data_file_name(index);
        let log_file = LogFile::new(dir, name.as_str());
        log_file.prepare_write(base).unwrap();
        let serializer = SerializerKind::Json.build();
        for &seqno in seqnos {
            let event = ThlEvent::new(seqno, seqno.to_string(), vec![]);
            let record = encode_event(&event, serializer.as_ref(), true).unwrap();
            log_file.write_record(&record, 0).unwrap();
        }
        log_file.release().unwrap();
        name
    }

    fn three_segment_index(dir: &TempDir) -> LogIndex {
        let names = vec![
            write_segment(dir.path(), 1, -1, &[0, 1, 2]),
            write_segment(dir.path(), 2, 3, &[3, 4, 5]),
            write_segment(dir.path(), 3, 6, &[6, 7]),
        ];
        let mut index = LogIndex::build(dir.path(), &names).unwrap();
        index.set_max_indexed_seqno(7);
        index
    }

    #[test]
    fn test_build_resolves_ranges() {
        let dir = TempDir::new().unwrap();
        let index = three_segment_index(&dir);
        let ranges: Vec<(i64, i64)> = index
            .entries()
            .iter()
            .map(|e| (e.start_seqno, e.end_seqno))
            .collect();
        assert_eq!(ranges, vec![(0, 2), (3, 5), (6, 7)]);
        assert_eq!(index.min_indexed_seqno(), 0);
        assert_eq!(index.max_indexed_seqno(), 7);
        index.validate().unwrap();
    }

    #[test]
    fn test_file_for_lookup() {
        let dir = TempDir::new().unwrap();
        let index = three_segment_index(&dir);
        assert_eq!(index.file_for(-1), None);
        assert_eq!(index.file_for(0), Some(data_file_name(1).as_str()));
        assert_eq!(index.file_for(4), Some(data_file_name(2).as_str()));
        assert_eq!(index.file_for(7), Some(data_file_name(3).as_str()));
        assert_eq!(index.file_for(1_000), Some(data_file_name(3).as_str()));
    }

    #[test]
    fn test_uninitialized_log_maps_every_seqno_to_first_file() {
        let dir = TempDir::new().unwrap();
        let names = vec![write_segment(dir.path(), 1, -1, &[])];
        let index = LogIndex::build(dir.path(), &names).unwrap();
        assert_eq!(index.max_indexed_seqno(), -1);
        assert_eq!(index.min_indexed_seqno(), -1);
        assert_eq!(index.file_for(25), Some(names[0].as_str()));
    }

    #[test]
    fn test_validate_detects_gap_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut index = three_segment_index(&dir);
        index.entries[1].end_seqno = 4;
        assert!(matches!(index.validate(), Err(ThlError::Consistency(_))));

        let mut index = three_segment_index(&dir);
        fs::remove_file(dir.path().join(data_file_name(2))).unwrap();
        index.entries[1].end_seqno = 5;
        assert!(matches!(index.validate(), Err(ThlError::Consistency(_))));
    }

    #[test]
    fn test_new_file_is_empty_tail() {
        let dir = TempDir::new().unwrap();
        let mut index = three_segment_index(&dir);
        let name = write_segment(dir.path(), 4, 8, &[]);
        index.add_new_file(8, name.as_str());
        assert_eq!(index.max_indexed_seqno(), 7);
        index.validate().unwrap();
        assert_eq!(index.file_for(8), Some(name.as_str()));
    }

    #[test]
    fn test_purge_keeps_minimum_and_active_segments() {
        let dir = TempDir::new().unwrap();
        let mut index = three_segment_index(&dir);

        let purged = index.purge_expired(Duration::ZERO, Some(1)).unwrap();
        assert!(purged.is_empty());

        let purged = index.purge_expired(Duration::ZERO, None).unwrap();
        assert_eq!(purged, vec![data_file_name(1)]);
        assert_eq!(index.len(), MIN_RETAINED_FILES);
        assert!(!dir.path().join(data_file_name(1)).exists());

        assert!(index.purge_expired(Duration::ZERO, None).unwrap().is_empty());
        assert_eq!(index.min_indexed_seqno(), 3);
    }

    #[test]
    fn test_purge_skips_recent_segments() {
        let dir = TempDir::new().unwrap();
        let mut index = three_segment_index(&dir);
        let purged = index.purge_expired(Duration::from_secs(3_600), None).unwrap();
        assert!(purged.is_empty());
        assert_eq!(index.len(), 3);
    }
}
