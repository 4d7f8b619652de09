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

//! The local Maildir tree as seen by synchronisation.
//!
//! A `MaildirTree` wraps a directory on disk plus the `SyncState` kept in its
//! hidden state directory. Every mutation goes through here so that the
//! manifest, tombstones and rename records stay consistent with the file
//! system; the server and the reconciliation driver share one instance.
//!
//! All paths are relative and `/`-separated. All times are milliseconds
//! truncated to whole seconds, since that is the precision peers exchange.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tempfile::NamedTempFile;
use tiny_keccak::{Hasher, Sha3};

use super::state::{FileRecord, RenameRecord, SyncState};
use crate::support::chronox::{now_seconds_ms, system_time_ms, truncate_ms};
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::safe_name::{is_safe_path, is_safe_segment, STATE_DIR_NAME};
use crate::sync::cached_dir::{add_paths, CachedDirs};
use crate::sync::remote_file::{split_full_path, RemoteFile};

pub type ContentHash = [u8; 32];

pub struct MaildirTree {
    root: PathBuf,
    tmp: PathBuf,
    garbage: PathBuf,
    state_file: PathBuf,
    retention_ms: i64,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SyncState,
    /// Whether `state` has changes not yet written to disk.
    dirty: bool,
    /// Content hashes by path, valid while the file still has the recorded
    /// modification time and length.
    hashes: HashMap<String, (i64, i64, ContentHash)>,
}

#[derive(Default)]
struct Found {
    dirs: BTreeMap<String, i64>,
    files: BTreeMap<String, FileRecord>,
}

impl MaildirTree {
    /// Open the tree rooted at `root`, creating the root and state directory
    /// if needed.
    ///
    /// Tombstones are kept for `retention`.
    pub fn open(
        root: impl Into<PathBuf>,
        retention: Duration,
    ) -> Result<Self, Error> {
        let root = root.into();
        let state_dir = root.join(STATE_DIR_NAME);
        let tmp = state_dir.join("tmp");
        let garbage = state_dir.join("garbage");
        fs::create_dir_all(&tmp)?;
        fs::create_dir_all(&garbage)?;

        // Anything left in garbage is from a removal interrupted by a crash
        for entry in fs::read_dir(&garbage)? {
            let path = entry?.path();
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!("Failed to clean up {}: {}", path.display(), e);
            }
        }

        let state_file = state_dir.join("state.cbor");
        let state = SyncState::load(&state_file)?;

        Ok(MaildirTree {
            root,
            tmp,
            garbage,
            state_file,
            retention_ms: retention.as_millis().min(i64::MAX as u128) as i64,
            inner: Mutex::new(Inner {
                state,
                dirty: false,
                hashes: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, Error> {
        if is_safe_path(path) {
            Ok(self.root.join(path))
        } else {
            Err(Error::UnsafeName)
        }
    }

    /// Like `resolve`, but the path must name something inside a directory,
    /// since files are never kept at the root of the tree.
    fn resolve_file(&self, path: &str) -> Result<PathBuf, Error> {
        let abs = self.resolve(path)?;
        if split_full_path(path).0.is_empty() {
            Err(Error::UnsafeName)
        } else {
            Ok(abs)
        }
    }

    fn save(&self, inner: &mut Inner) -> Result<(), Error> {
        inner.state.save(&self.tmp, &self.state_file)?;
        inner.dirty = false;
        Ok(())
    }

    /// Write the manifest to disk if anything changed since it was last
    /// written.
    pub fn flush(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.dirty {
            self.save(&mut inner)?;
        }
        Ok(())
    }

    /// Bring the manifest up to date with the file system.
    ///
    /// Files and directories that disappeared since the previous scan are
    /// tombstoned as of now, except that files inside a vanished directory
    /// are simply forgotten, since the directory tombstone covers them. A
    /// vanished file whose Maildir unique name and length reappear under a
    /// new path is additionally recorded as renamed.
    pub fn scan(&self) -> Result<(), Error> {
        // Hold the lock throughout so that nothing written concurrently is
        // mistaken for a deletion.
        let mut inner = self.lock();

        let mut found = Found::default();
        walk(&self.root, "", &mut found)?;

        let now = now_seconds_ms();
        let state = &mut inner.state;

        let vanished_dirs = state
            .dirs
            .keys()
            .filter(|d| !found.dirs.contains_key(*d))
            .cloned()
            .collect::<Vec<_>>();
        for dir in vanished_dirs {
            debug!("Directory {} vanished", dir);
            state.tombstone_dir(&dir, now);
        }

        let mut arrivals = found
            .files
            .iter()
            .filter(|&(path, _)| !state.files.contains_key(path))
            .map(|(path, record)| {
                ((unique_name(path).to_owned(), record.length), path.clone())
            })
            .collect::<HashMap<_, _>>();

        let vanished_files = state
            .files
            .iter()
            .filter(|&(path, _)| !found.files.contains_key(path))
            .map(|(path, record)| (path.clone(), *record))
            .collect::<Vec<_>>();
        for (path, record) in vanished_files {
            if !found.dirs.contains_key(split_full_path(&path).0) {
                continue;
            }

            state.tombstone_file(&path, now);
            if let Some(to) =
                arrivals.remove(&(unique_name(&path).to_owned(), record.length))
            {
                debug!("{} was renamed to {}", path, to);
                state.renames.insert(
                    to,
                    RenameRecord {
                        from: path.clone(),
                        at: now,
                        last_modified: record.last_modified,
                    },
                );
            } else {
                debug!("{} vanished", path);
            }
        }

        for path in found.files.keys() {
            state.file_tombstones.remove(path);
        }
        for path in found.dirs.keys() {
            state.dir_tombstones.remove(path);
        }
        state.files = found.files;
        state.dirs = found.dirs;

        if state.prune(now - self.retention_ms) {
            info!("Pruned expired tombstones in {}", self.root.display());
        }

        self.save(&mut inner)
    }

    /// Build the directory tree, tombstones included, as of the last scan
    /// or mutation.
    pub fn dir_tree(&self) -> CachedDirs {
        let inner = self.lock();
        let mut tree = CachedDirs::new();
        for (path, &deleted) in &inner.state.dir_tombstones {
            tree.insert(path, -deleted.max(1));
        }
        for (path, &last_modified) in &inner.state.dirs {
            tree.insert(path, last_modified);
        }
        tree
    }

    /// List the files and file tombstones directly inside `dir` whose
    /// timestamp (deletion time, for tombstones) is at least `since`.
    pub fn list(&self, dir: &str, since: i64) -> Result<Vec<RemoteFile>, Error> {
        if !dir.is_empty() && !is_safe_path(dir) {
            return Err(Error::UnsafeName);
        }

        let inner = self.lock();
        let mut out = Vec::new();
        for (name, record) in children(&inner.state.files, dir) {
            if record.last_modified >= since {
                out.push(RemoteFile::new(
                    record.last_modified,
                    record.length,
                    dir.to_owned(),
                    name.to_owned(),
                ));
            }
        }
        for (name, &deleted) in children(&inner.state.file_tombstones, dir) {
            if deleted >= since {
                out.push(RemoteFile::tombstone(
                    deleted,
                    dir.to_owned(),
                    name.to_owned(),
                ));
            }
        }

        Ok(out)
    }

    /// Look up a single file or file tombstone in the manifest.
    pub fn stat(&self, path: &str) -> Result<Option<RemoteFile>, Error> {
        self.resolve(path)?;
        let inner = self.lock();
        if let Some(record) = inner.state.files.get(path) {
            Ok(Some(RemoteFile::from_full_path(
                record.last_modified,
                record.length,
                path,
            )))
        } else if let Some(&deleted) = inner.state.file_tombstones.get(path) {
            let (dir, name) = split_full_path(path);
            Ok(Some(RemoteFile::tombstone(
                deleted,
                dir.to_owned(),
                name.to_owned(),
            )))
        } else {
            Ok(None)
        }
    }

    /// Open the file at `path` for reading, along with its current identity.
    pub fn open_file(&self, path: &str) -> Result<(RemoteFile, fs::File), Error> {
        let abs = self.resolve_file(path)?;
        let file = fs::File::open(&abs).map_err(not_found)?;
        let md = file.metadata()?;
        if !md.is_file() {
            return Err(Error::NotFound);
        }

        Ok((
            RemoteFile::from_full_path(
                truncate_ms(system_time_ms(md.modified()?)),
                md.len() as i64,
                path,
            ),
            file,
        ))
    }

    /// Create an empty temporary file which can later be passed to
    /// `install`.
    pub fn stage(&self) -> Result<NamedTempFile, Error> {
        Ok(NamedTempFile::new_in(&self.tmp)?)
    }

    /// Atomically move a file created by `stage` to `path`, replacing
    /// whatever is there, with modification time `last_modified`.
    ///
    /// Missing parent directories are created.
    pub fn install(
        &self,
        staged: NamedTempFile,
        path: &str,
        last_modified: i64,
    ) -> Result<(), Error> {
        let abs = self.resolve_file(path)?;
        let last_modified = truncate_ms(last_modified);

        staged.as_file().sync_all()?;
        let length = staged.as_file().metadata()?.len() as i64;
        file_ops::set_mtime(staged.path(), last_modified)?;

        let mut inner = self.lock();
        self.ensure_dir(&mut inner.state, split_full_path(path).0)?;
        staged.persist(&abs).map_err(|e| e.error)?;

        let state = &mut inner.state;
        state.files.insert(
            path.to_owned(),
            FileRecord {
                last_modified,
                length,
            },
        );
        state.file_tombstones.remove(path);
        state.renames.remove(path);
        inner.dirty = true;
        Ok(())
    }

    /// Write exactly `len` bytes from `src` to `path`, atomically, with
    /// modification time `last_modified`.
    pub fn write_file(
        &self,
        path: &str,
        last_modified: i64,
        src: &mut impl Read,
        len: u64,
    ) -> Result<(), Error> {
        self.resolve_file(path)?;
        let mut staged = self.stage()?;
        file_ops::copy_exact(src, staged.as_file_mut(), len)?;
        self.install(staged, path, last_modified)
    }

    /// Rename `from` to `to`, giving the result modification time `time`.
    ///
    /// If `from` is already gone but `to` exists, the move is assumed to have
    /// happened already and this succeeds without doing anything.
    pub fn move_file(&self, from: &str, to: &str, time: i64) -> Result<(), Error> {
        let abs_from = self.resolve_file(from)?;
        let abs_to = self.resolve_file(to)?;
        let time = truncate_ms(time);

        let mut inner = self.lock();
        let md = match fs::symlink_metadata(&abs_from) {
            Ok(md) if md.is_file() => md,
            Ok(_) => return Err(Error::NotFound),
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                return if abs_to.is_file() {
                    Ok(())
                } else {
                    Err(Error::NotFound)
                };
            }
            Err(e) => return Err(e.into()),
        };

        self.ensure_dir(&mut inner.state, split_full_path(to).0)?;
        fs::rename(&abs_from, &abs_to)?;
        file_ops::set_mtime(&abs_to, time)?;

        let state = &mut inner.state;
        state.files.remove(from);
        state.renames.remove(from);
        state.tombstone_file(from, time.max(now_seconds_ms()));
        state.files.insert(
            to.to_owned(),
            FileRecord {
                last_modified: time,
                length: md.len() as i64,
            },
        );
        state.file_tombstones.remove(to);
        state.renames.remove(to);
        self.save(&mut inner)
    }

    /// Delete the file at `path` as of `deleted`.
    ///
    /// The file is only removed if it was not modified after `deleted`;
    /// otherwise it is newer than the deletion and survives. Returns whether
    /// the deletion took effect, which includes the case where there was no
    /// file to begin with.
    pub fn delete_file(&self, path: &str, deleted: i64) -> Result<bool, Error> {
        let abs = self.resolve_file(path)?;
        let deleted = truncate_ms(deleted);

        let mut inner = self.lock();
        match fs::symlink_metadata(&abs) {
            Ok(md) if md.is_file() => {
                let mtime = truncate_ms(system_time_ms(md.modified()?));
                if mtime > deleted {
                    debug!(
                        "Not deleting {}: modified after the deletion",
                        path
                    );
                    return Ok(false);
                }

                fs::remove_file(&abs).ignore_not_found()?;
            }
            Ok(_) => return Err(Error::NotFound),
            Err(e) if io::ErrorKind::NotFound == e.kind() => (),
            Err(e) => return Err(e.into()),
        }

        let state = &mut inner.state;
        state.files.remove(path);
        state.renames.remove(path);
        state.tombstone_file(path, deleted);
        self.save(&mut inner)?;
        Ok(true)
    }

    /// Create the directory at `path` and any missing parents.
    ///
    /// If the directory did not already exist, its modification time is set
    /// to `last_modified`. Existing directories are left alone.
    pub fn make_dir(&self, path: &str, last_modified: i64) -> Result<(), Error> {
        let abs = self.resolve(path)?;
        let last_modified = truncate_ms(last_modified);

        let mut inner = self.lock();
        if abs.is_dir() {
            self.ensure_dir(&mut inner.state, path)?;
            inner.dirty = true;
            return Ok(());
        }

        let (parent, _) = split_full_path(path);
        self.ensure_dir(&mut inner.state, parent)?;
        fs::create_dir(&abs).ignore_already_exists()?;
        file_ops::set_mtime(&abs, last_modified)?;

        inner.state.dirs.insert(path.to_owned(), last_modified);
        inner.state.dir_tombstones.remove(path);
        inner.dirty = true;
        Ok(())
    }

    /// Remove the directory at `path` and everything in it, recording a
    /// tombstone as of `deleted`.
    ///
    /// Removing a directory which does not exist still records the
    /// tombstone.
    pub fn remove_dir(&self, path: &str, deleted: i64) -> Result<(), Error> {
        let abs = self.resolve(path)?;
        let deleted = truncate_ms(deleted);

        let mut inner = self.lock();
        match fs::symlink_metadata(&abs) {
            Ok(md) if md.is_dir() => {
                file_ops::delete_async(&abs, &self.garbage)?
            }
            Ok(_) => return Err(Error::NotFound),
            Err(e) if io::ErrorKind::NotFound == e.kind() => (),
            Err(e) => return Err(e.into()),
        }

        inner.state.forget_subtree(path);
        inner.state.tombstone_dir(path, deleted);
        self.save(&mut inner)
    }

    /// Set the modification time of the file or directory at `path`.
    pub fn touch(&self, path: &str, last_modified: i64) -> Result<(), Error> {
        let abs = self.resolve(path)?;
        let last_modified = truncate_ms(last_modified);

        let mut inner = self.lock();
        let md = fs::metadata(&abs).map_err(not_found)?;
        file_ops::set_mtime(&abs, last_modified)?;

        let state = &mut inner.state;
        if md.is_dir() {
            state.dirs.insert(path.to_owned(), last_modified);
        } else {
            state.files.insert(
                path.to_owned(),
                FileRecord {
                    last_modified,
                    length: md.len() as i64,
                },
            );
            state.file_tombstones.remove(path);
        }
        inner.dirty = true;
        Ok(())
    }

    /// Return every rename record noticed at or after `since`, as
    /// `(new path, record)` pairs.
    pub fn renames(&self, since: i64) -> Vec<(String, RenameRecord)> {
        self.lock()
            .state
            .renames
            .iter()
            .filter(|&(_, r)| r.at >= since)
            .map(|(to, r)| (to.clone(), r.clone()))
            .collect()
    }

    pub fn watermark(&self, peer: &str) -> Option<i64> {
        self.lock().state.watermarks.get(peer).copied()
    }

    pub fn set_watermark(&self, peer: &str, watermark: i64) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.state.watermarks.insert(peer.to_owned(), watermark);
        self.save(&mut inner)
    }

    /// Compute the SHA-3 of the content of the file at `path`.
    pub fn content_hash(&self, path: &str) -> Result<ContentHash, Error> {
        let (identity, file) = self.open_file(path)?;
        let key = (identity.timestamp(), identity.length());
        if let Some(&(mtime, length, hash)) = self.lock().hashes.get(path) {
            if (mtime, length) == key {
                return Ok(hash);
            }
        }

        let hash = hash_reader(io::BufReader::new(file))?;
        self.lock()
            .hashes
            .insert(path.to_owned(), (key.0, key.1, hash));
        Ok(hash)
    }

    /// Compute the content hash of every live file directly inside `dir`,
    /// yielding file names.
    ///
    /// Files which disappear in the meantime are left out.
    pub fn hashes(&self, dir: &str) -> Result<Vec<(String, ContentHash)>, Error> {
        if !dir.is_empty() && !is_safe_path(dir) {
            return Err(Error::UnsafeName);
        }

        let names = children(&self.lock().state.files, dir)
            .map(|(name, _)| name.to_owned())
            .collect::<Vec<_>>();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.content_hash(&add_paths(dir, &name)) {
                Ok(hash) => out.push((name, hash)),
                Err(Error::NotFound) => (),
                Err(e) => return Err(e),
            }
        }

        Ok(out)
    }

    /// Make sure that `dir` and all its parents exist, recording any that
    /// have to be created.
    fn ensure_dir(&self, state: &mut SyncState, dir: &str) -> Result<(), Error> {
        let mut path = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            path = add_paths(&path, segment);
            if state.dirs.contains_key(&path) {
                continue;
            }

            let abs = self.resolve(&path)?;
            fs::create_dir(&abs).ignore_already_exists()?;
            let mtime = truncate_ms(system_time_ms(fs::metadata(&abs)?.modified()?));
            state.dirs.insert(path.clone(), mtime);
            state.dir_tombstones.remove(&path);
        }

        Ok(())
    }
}

/// Compute the SHA-3 of everything `data` produces.
pub fn hash_reader(mut data: impl Read) -> io::Result<ContentHash> {
    let mut buf = [0u8; 4096];
    let mut sha3 = Sha3::v256();

    loop {
        let nread = data.read(&mut buf)?;
        if 0 == nread {
            break;
        }

        sha3.update(&buf[..nread]);
    }

    let mut hash = [0u8; 32];
    sha3.finalize(&mut hash);
    Ok(hash)
}

fn not_found(e: io::Error) -> Error {
    if io::ErrorKind::NotFound == e.kind() {
        Error::NotFound
    } else {
        e.into()
    }
}

/// The Maildir unique name of the file at `path`: its name up to the first
/// `:`, which is where the flags start.
fn unique_name(path: &str) -> &str {
    let (_, name) = split_full_path(path);
    name.split(':').next().unwrap_or(name)
}

/// Iterate the entries of `map` that are directly inside `dir`, yielding
/// their names.
fn children<'a, V>(
    map: &'a BTreeMap<String, V>,
    dir: &str,
) -> impl Iterator<Item = (&'a str, &'a V)> + 'a {
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    };
    let prefix_len = prefix.len();

    map.range(prefix.clone()..)
        .take_while(move |&(k, _)| k.starts_with(&prefix))
        .map(move |(k, v)| (&k[prefix_len..], v))
        .filter(|&(name, _)| !name.contains('/'))
}

fn walk(dir: &Path, rel: &str, found: &mut Found) -> Result<(), Error> {
    // Files in a Maildir `tmp` are deliveries still in progress
    let in_tmp = "tmp" == split_full_path(rel).1;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // Removed while we were looking at it
        Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                warn!("Ignoring non-UTF-8 name {:?} in {}", name, rel);
                continue;
            }
        };

        if rel.is_empty() && STATE_DIR_NAME == name {
            continue;
        }

        if !is_safe_segment(&name) {
            warn!("Ignoring unsafe name {:?} in {}", name, rel);
            continue;
        }

        let md = match entry.metadata() {
            Ok(md) => md,
            Err(e) if io::ErrorKind::NotFound == e.kind() => continue,
            Err(e) => return Err(e.into()),
        };
        let mtime = truncate_ms(system_time_ms(md.modified()?));
        let path = add_paths(rel, &name);

        if md.is_dir() {
            found.dirs.insert(path.clone(), mtime);
            walk(&entry.path(), &path, found)?;
        } else if md.is_file() && !rel.is_empty() && !in_tmp {
            found.files.insert(
                path,
                FileRecord {
                    last_modified: mtime,
                    length: md.len() as i64,
                },
            );
        }
    }

    Ok(())
}
