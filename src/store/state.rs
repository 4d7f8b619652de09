//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! The persisted synchronisation state of one tree.
//!
//! The file system only tells us what exists now. Everything else needed to
//! converge with peers (what used to exist, when it went away, where it
//! went, and how far each peer has been brought up to date) lives here, in a
//! single CBOR file replaced atomically on every save.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;
use crate::support::file_ops;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Milliseconds, truncated to whole seconds.
    pub last_modified: i64,
    pub length: i64,
}

/// Records that the file now at some path used to be at `from`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRecord {
    pub from: String,
    /// When the rename was noticed.
    pub at: i64,
    /// The modification time of `from` before it was renamed.
    #[serde(default)]
    pub last_modified: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Every file as of the last scan or mutation, by full path.
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
    /// Every directory, by path, to its last modification time.
    #[serde(default)]
    pub dirs: BTreeMap<String, i64>,
    /// Deleted files, by full path, to the time of deletion.
    #[serde(default)]
    pub file_tombstones: BTreeMap<String, i64>,
    /// Deleted directories, by path, to the time of deletion.
    #[serde(default)]
    pub dir_tombstones: BTreeMap<String, i64>,
    /// Detected renames, keyed by the new full path.
    #[serde(default)]
    pub renames: BTreeMap<String, RenameRecord>,
    /// Per-peer watermarks, in milliseconds.
    #[serde(default)]
    pub watermarks: BTreeMap<String, i64>,
}

impl SyncState {
    /// Load the state at `path`, or an empty state if there is none yet.
    pub fn load(path: &Path) -> Result<Self, Error> {
        match fs::File::open(path) {
            Ok(file) => Ok(serde_cbor::from_reader(io::BufReader::new(file))?),
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                Ok(SyncState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the file at `path` with this state, staging it in
    /// `tmp`.
    pub fn save(&self, tmp: &Path, path: &Path) -> Result<(), Error> {
        let data = serde_cbor::to_vec(self)?;
        file_ops::spit(tmp, path, &data)?;
        Ok(())
    }

    /// Record a file tombstone, keeping the later deletion time if there
    /// already is one.
    pub fn tombstone_file(&mut self, path: &str, deleted: i64) {
        let entry = self.file_tombstones.entry(path.to_owned()).or_insert(0);
        *entry = (*entry).max(deleted);
    }

    /// Record a directory tombstone, keeping the later deletion time if
    /// there already is one.
    pub fn tombstone_dir(&mut self, path: &str, deleted: i64) {
        let entry = self.dir_tombstones.entry(path.to_owned()).or_insert(0);
        *entry = (*entry).max(deleted);
    }

    /// Forget everything at or beneath the directory `path`, except for
    /// watermarks.
    pub fn forget_subtree(&mut self, path: &str) {
        fn retain_outside<V>(map: &mut BTreeMap<String, V>, path: &str) {
            map.retain(|k, _| !is_within(path, k));
        }

        retain_outside(&mut self.files, path);
        retain_outside(&mut self.dirs, path);
        retain_outside(&mut self.file_tombstones, path);
        retain_outside(&mut self.dir_tombstones, path);
        self.renames
            .retain(|k, v| !is_within(path, k) && !is_within(path, &v.from));
    }

    /// Drop tombstones and rename records older than `cutoff`.
    ///
    /// Returns whether anything was dropped.
    pub fn prune(&mut self, cutoff: i64) -> bool {
        let before = self.file_tombstones.len()
            + self.dir_tombstones.len()
            + self.renames.len();
        self.file_tombstones.retain(|_, &mut t| t >= cutoff);
        self.dir_tombstones.retain(|_, &mut t| t >= cutoff);
        self.renames.retain(|_, r| r.at >= cutoff);
        before
            != self.file_tombstones.len()
                + self.dir_tombstones.len()
                + self.renames.len()
    }
}

/// Whether `path` is `dir` or lies beneath it.
pub fn is_within(dir: &str, path: &str) -> bool {
    path == dir
        || (path.starts_with(dir) && path.as_bytes().get(dir.len()) == Some(&b'/'))
}
