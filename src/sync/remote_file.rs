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

use std::fmt;

use super::cached_dir::add_paths;

/// The identity of one file on some tree, as of the moment it was queried.
///
/// This is a plain value, not a handle; it says nothing about the file after
/// the query that produced it.
///
/// A negative `timestamp` marks a tombstone: the file was deleted at
/// `-timestamp`, and `length` is meaningless.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteFile {
    timestamp: i64,
    length: i64,
    path: String,
    name: String,
}

impl RemoteFile {
    pub fn new(timestamp: i64, length: i64, path: String, name: String) -> Self {
        RemoteFile {
            timestamp,
            length,
            path,
            name,
        }
    }

    /// Construct a tombstone for a file deleted at `deleted_at`.
    pub fn tombstone(deleted_at: i64, path: String, name: String) -> Self {
        // A deletion at exactly the epoch is still a deletion
        Self::new(-deleted_at.max(1), 0, path, name)
    }

    /// Construct from a full `/`-separated path.
    pub fn from_full_path(timestamp: i64, length: i64, full_path: &str) -> Self {
        let (path, name) = split_full_path(full_path);
        Self::new(timestamp, length, path.to_owned(), name.to_owned())
    }

    /// Last modification time, in milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    /// The directory containing the file.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_path(&self) -> String {
        add_paths(&self.path, &self.name)
    }

    pub fn is_deleted(&self) -> bool {
        self.timestamp < 0
    }

    /// If this is a tombstone, when the file was deleted.
    pub fn deleted_at(&self) -> Option<i64> {
        if self.is_deleted() {
            Some(-self.timestamp)
        } else {
            None
        }
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.deleted_at() {
            Some(at) => write!(f, "{} (deleted @{})", self.full_path(), at),
            None => write!(
                f,
                "{} ({} bytes @{})",
                self.full_path(),
                self.length,
                self.timestamp
            ),
        }
    }
}

/// Split `full_path` into its directory and final segment.
pub fn split_full_path(full_path: &str) -> (&str, &str) {
    let full_path = full_path.trim_matches('/');
    match full_path.rfind('/') {
        Some(ix) => (&full_path[..ix], &full_path[ix + 1..]),
        None => ("", full_path),
    }
}
