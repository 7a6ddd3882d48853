// SPDX-License-Identifier: PMPL-1.0-or-later
//
// THL disk log - Cross-process write lock
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

use crate::error::ThlResult;

/// Exclusive advisory lock on a file in the log directory. At most one
/// process holds it, and only the holder may open the log for writing.
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
    file: Option<File>,
}

impl WriteLock {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock without blocking. Returns `true` if this instance
    /// now holds it (including when it already did) and `false` if someone
    /// else does. Failing to create the lock file is an error.
    pub fn acquire(&mut self) -> ThlResult<bool> {
        if self.file.is_some() {
            return Ok(true);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!(lock = %self.path.display(), "Acquired THL write lock");
                self.file = Some(file);
                Ok(true)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!(lock = %self.path.display(), "THL write lock is held elsewhere");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Give up the lock. Safe to call when not held.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // Closing the descriptor drops the lock even if unlock fails.
            let _ = FileExt::unlock(&file);
            debug!(lock = %self.path.display(), "Released THL write lock");
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        self.release();
    }
}
