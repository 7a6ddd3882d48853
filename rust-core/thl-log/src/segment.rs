// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Segment naming and discovery
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Each segment is a file named `thl.data.{index:010}`. The index starts at 1
// and increases by one on every rotation; rotation markers carry the index of
// the segment that follows.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ThlError, ThlResult};

/// The prefix used for segment file names.
pub const DATA_FILE_PREFIX: &str = "thl.data.";

/// Width of the zero-padded index (digits in `u32::MAX`).
pub const DATA_FILE_INDEX_WIDTH: usize = 10;

/// Name of the write lock file kept in the log directory.
pub const LOCK_FILE_NAME: &str = "thl.lock";

/// Index of the first segment in a new log.
pub const FIRST_FILE_INDEX: u32 = 1;

/// Build the canonical file name for the segment with the given index.
///
/// Format: `thl.data.0000000001`
pub fn data_file_name(index: u32) -> String {
    format!("{DATA_FILE_PREFIX}{index:0width$}", width = DATA_FILE_INDEX_WIDTH)
}

/// Build the full path for a segment in the given log directory.
pub fn data_file_path(log_dir: &Path, index: u32) -> PathBuf {
    log_dir.join(data_file_name(index))
}

/// Parse the index from a segment file name.
///
/// Returns `None` if the name does not match the expected pattern.
pub fn parse_data_file_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(DATA_FILE_PREFIX)?;
    if digits.len() != DATA_FILE_INDEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u32>().ok()
}

/// Scan a log directory and return the names of all segment files, sorted
/// by index (ascending).
///
/// Non-segment files in the directory are silently ignored.
pub fn list_data_files(log_dir: &Path) -> ThlResult<Vec<String>> {
    if !log_dir.is_dir() {
        return Err(ThlError::NotFound(log_dir.display().to_string()));
    }

    let mut segments: Vec<(u32, String)> = Vec::new();
    for dir_entry in fs::read_dir(log_dir)? {
        let dir_entry = dir_entry?;
        let file_name = dir_entry.file_name();
        let name = file_name.to_string_lossy();
        if let Some(index) = parse_data_file_index(&name) {
            segments.push((index, name.into_owned()));
        }
    }
    segments.sort();

    debug!(
        count = segments.len(),
        dir = %log_dir.display(),
        "Discovered THL segments"
    );

    Ok(segments.into_iter().map(|(_, name)| name).collect())
}
