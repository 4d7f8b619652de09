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

//! An in-memory mirror of the directory structure of one tree.
//!
//! Each node owns its children outright, keyed by path segment. Nothing
//! points back up the tree: construction (from `DIR` responses or a local
//! scan) and diffing both only ever walk from the root downwards.

use std::collections::btree_map::{BTreeMap, Entry};

/// Whether a `CachedDir` exists or merely records a deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirKind {
    Plain,
    /// The directory existed but was removed. It stays in the tree so that
    /// lookups beneath it still resolve, but reconciliation treats it as
    /// absent.
    Tombstone,
}

impl DirKind {
    fn for_last_modified(last_modified: i64) -> Self {
        if last_modified < 0 {
            DirKind::Tombstone
        } else {
            DirKind::Plain
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedDir {
    path: String,
    /// Milliseconds since the epoch. Negative for tombstones, in which case
    /// the magnitude is the time of deletion.
    last_modified: i64,
    kind: DirKind,
    subdirs: BTreeMap<String, CachedDir>,
}

impl CachedDir {
    /// Create a free-standing node. Its kind follows the sign of
    /// `last_modified`.
    pub fn new(path: String, last_modified: i64) -> Self {
        CachedDir {
            path,
            last_modified,
            kind: DirKind::for_last_modified(last_modified),
            subdirs: BTreeMap::new(),
        }
    }

    /// Create a free-standing tombstone for a directory deleted at
    /// `deleted_at`.
    pub fn tombstone(path: String, deleted_at: i64) -> Self {
        Self::new(path, -deleted_at.max(1))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The final segment of the path, or `""` for the root.
    pub fn name(&self) -> &str {
        match self.path.rfind('/') {
            Some(ix) => &self.path[ix + 1..],
            None => &self.path,
        }
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn kind(&self) -> DirKind {
        self.kind
    }

    pub fn is_tombstone(&self) -> bool {
        DirKind::Tombstone == self.kind
    }

    pub fn deleted_at(&self) -> Option<i64> {
        if self.is_tombstone() {
            Some(-self.last_modified)
        } else {
            None
        }
    }

    pub fn set_last_modified(&mut self, last_modified: i64) {
        self.last_modified = last_modified;
        self.kind = DirKind::for_last_modified(last_modified);
    }

    pub fn get_subdir(&self, name: &str) -> Option<&CachedDir> {
        self.subdirs.get(name)
    }

    pub fn get_subdir_mut(&mut self, name: &str) -> Option<&mut CachedDir> {
        self.subdirs.get_mut(name)
    }

    /// Return the child called `name`, creating it as a plain directory with
    /// a zero timestamp if it does not exist yet.
    pub fn add_subdir(&mut self, name: &str) -> &mut CachedDir {
        let path = &self.path;
        self.subdirs
            .entry(name.to_owned())
            .or_insert_with(|| CachedDir::new(add_paths(path, name), 0))
    }

    /// Insert a pre-built child, replacing any existing child of the same
    /// name.
    ///
    /// `node`'s path is rewritten to be beneath this node.
    pub fn add_subdir_node(
        &mut self,
        name: &str,
        mut node: CachedDir,
    ) -> &mut CachedDir {
        node.path = add_paths(&self.path, name);
        match self.subdirs.entry(name.to_owned()) {
            Entry::Occupied(mut e) => {
                e.insert(node);
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(node),
        }
    }

    pub fn subdirs(&self) -> impl Iterator<Item = &CachedDir> {
        self.subdirs.values()
    }

    /// Iterate this node and all its descendants, parents before children,
    /// siblings in name order.
    pub fn iter(&self) -> Iter<'_> {
        Iter { stack: vec![self] }
    }
}

pub struct Iter<'a> {
    stack: Vec<&'a CachedDir>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a CachedDir;

    fn next(&mut self) -> Option<&'a CachedDir> {
        let next = self.stack.pop()?;
        self.stack.extend(next.subdirs.values().rev());
        Some(next)
    }
}

/// The directory tree of one peer, as of the last refresh.
///
/// The root is always a plain directory with the empty path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedDirs {
    root: CachedDir,
}

impl Default for CachedDirs {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedDirs {
    pub fn new() -> Self {
        CachedDirs {
            root: CachedDir::new(String::new(), 0),
        }
    }

    pub fn root(&self) -> &CachedDir {
        &self.root
    }

    /// Discard the whole tree.
    pub fn clear(&mut self) {
        self.root = CachedDir::new(String::new(), 0);
    }

    /// Look up the node at `path`. The empty path is the root.
    pub fn get(&self, path: &str) -> Option<&CachedDir> {
        let mut node = &self.root;
        for segment in segments(path) {
            node = node.get_subdir(segment)?;
        }
        Some(node)
    }

    /// Record that the directory at `path` has the given timestamp.
    ///
    /// Missing intermediate directories are created as plain directories. If
    /// the final directory is missing, it is created as a tombstone if
    /// `last_modified` is negative and as a plain directory otherwise. Either
    /// way, its timestamp ends up as `last_modified`.
    ///
    /// Returns `None` if `path` has no segments at all.
    pub fn insert(
        &mut self,
        path: &str,
        last_modified: i64,
    ) -> Option<&mut CachedDir> {
        let segments = segments(path).collect::<Vec<_>>();
        let (&last, parents) = segments.split_last()?;

        let mut node = &mut self.root;
        for &segment in parents {
            node = node.add_subdir(segment);
        }

        let leaf = match node.subdirs.entry(last.to_owned()) {
            Entry::Occupied(e) => e.into_mut(),
            // new() picks tombstone or plain from the sign
            Entry::Vacant(e) => e.insert(CachedDir::new(
                add_paths(&node.path, last),
                last_modified,
            )),
        };

        leaf.set_last_modified(last_modified);
        Some(leaf)
    }

    /// Iterate every node except the root, parents before children.
    pub fn iter(&self) -> impl Iterator<Item = &CachedDir> {
        self.root.iter().skip(1)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Join `parent` and `child` into a normalised `/`-separated path.
///
/// Leading, trailing, and repeated slashes in either input are dropped, so
/// the result never starts or ends with `/` and splitting it on `/` yields
/// exactly the non-empty segments of the inputs.
pub fn add_paths(parent: &str, child: &str) -> String {
    let mut out = String::with_capacity(parent.len() + child.len() + 1);
    for segment in segments(parent).chain(segments(child)) {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    out
}
