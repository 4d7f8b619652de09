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

//! The reconciliation driver.
//!
//! A pass brings the local tree and one peer's tree into agreement, as far
//! as the peer's direction allows. Directories are reconciled first, top
//! down, from the two `DIR` listings. Directories that may have changed
//! since the peer's watermark are then listed in full on both sides and
//! reconciled file by file, with the later timestamp winning.
//!
//! Files with equal timestamps are compared by the SHA-3 of their contents.
//! The peer's hashes are fetched with one `HASH` per directory that has such
//! ties. Identical content is left alone; otherwise the greater hash wins, so
//! every peer picks the same winner no matter which side runs the pass.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::{Seek, SeekFrom};

use log::{debug, error, info, warn};

use super::cached_dir::{add_paths, CachedDir};
use super::client::SyncClient;
use super::remote_file::{split_full_path, RemoteFile};
use crate::store::tree::{hash_reader, ContentHash, MaildirTree};
use crate::support::chronox::{format_ms, now_seconds_ms};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::PeerConfig;

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pushed: usize,
    pub pulled: usize,
    pub moved: usize,
    pub deleted_remote: usize,
    pub deleted_local: usize,
    pub dirs_created_remote: usize,
    pub dirs_created_local: usize,
    pub dirs_removed_remote: usize,
    pub dirs_removed_local: usize,
    /// Files with equal timestamps but different content.
    pub conflicts: usize,
    /// Items that could not be reconciled this time.
    pub skipped: usize,
}

impl PassReport {
    /// Whether the pass changed nothing on either side.
    pub fn is_noop(&self) -> bool {
        0 == self.pushed
            + self.pulled
            + self.moved
            + self.deleted_remote
            + self.deleted_local
            + self.dirs_created_remote
            + self.dirs_created_local
            + self.dirs_removed_remote
            + self.dirs_removed_local
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "pushed {}, pulled {}, moved {}, deleted {}/{}, \
             created dirs {}/{}, removed dirs {}/{}, conflicts {}, skipped {}",
            self.pushed,
            self.pulled,
            self.moved,
            self.deleted_remote,
            self.deleted_local,
            self.dirs_created_remote,
            self.dirs_created_local,
            self.dirs_removed_remote,
            self.dirs_removed_local,
            self.conflicts,
            self.skipped
        )
    }
}

/// Run one reconciliation pass between `store` and the peer behind
/// `client`.
///
/// Directories whose modification time is older than the peer's watermark
/// minus `clock_skew_allowance_ms` are assumed unchanged. The watermark is
/// advanced to the start of the pass only if nothing had to be skipped.
///
/// An error means the pass was aborted, generally because the connection to
/// the peer failed. Whatever was done before that point stands.
pub fn run_pass(
    store: &MaildirTree,
    client: &mut SyncClient,
    peer: &PeerConfig,
    clock_skew_allowance_ms: i64,
    log_prefix: &LogPrefix,
) -> Result<PassReport, Error> {
    let pass_start = now_seconds_ms();
    let watermark = store.watermark(&peer.name);
    match watermark {
        Some(w) => info!(
            "{} Starting pass; watermark {}",
            log_prefix,
            format_ms(w)
        ),
        None => info!("{} Starting full pass", log_prefix),
    }

    let mut pass = Pass {
        store,
        client,
        peer,
        log_prefix,
        threshold: watermark
            .map(|w| w.saturating_sub(clock_skew_allowance_ms)),
        created: HashSet::new(),
        examine: Vec::new(),
        report: PassReport::default(),
    };
    let result = pass.run();
    let report = pass.report;

    if let Err(e) = store.flush() {
        error!("{} Failed to save sync state: {}", log_prefix, e);
        if result.is_ok() {
            return Err(e);
        }
    }

    if let Err(e) = result {
        warn!("{} Pass aborted ({}): {}", log_prefix, report, e);
        return Err(e);
    }

    if 0 == report.skipped {
        store.set_watermark(&peer.name, pass_start)?;
        info!("{} Pass complete: {}", log_prefix, report);
    } else {
        warn!(
            "{} Pass complete with skipped items, watermark not advanced: {}",
            log_prefix, report
        );
    }

    Ok(report)
}

/// The local or remote state of one directory.
#[derive(Clone, Copy, Debug)]
enum DirState {
    Absent,
    Present(i64),
    Deleted(i64),
}

impl DirState {
    fn of(dir: Option<&CachedDir>) -> Self {
        match dir {
            None => DirState::Absent,
            Some(dir) => match dir.deleted_at() {
                Some(deleted) => DirState::Deleted(deleted),
                None => DirState::Present(dir.last_modified()),
            },
        }
    }
}

struct Pass<'a> {
    store: &'a MaildirTree,
    client: &'a mut SyncClient,
    peer: &'a PeerConfig,
    log_prefix: &'a LogPrefix,
    /// Directories modified before this are not examined. `None` examines
    /// everything.
    threshold: Option<i64>,
    /// Directories created on either side during this pass.
    created: HashSet<String>,
    /// Directories to reconcile file by file, parents first.
    examine: Vec<String>,
    report: PassReport,
}

impl Pass<'_> {
    fn run(&mut self) -> Result<(), Error> {
        self.store.scan()?;
        let local = self.store.dir_tree();
        let remote = self.client.dir()?.clone();

        self.walk(Some(local.root()), Some(remote.root()))?;
        self.replay_renames()?;

        let examine = std::mem::take(&mut self.examine);
        for dir in &examine {
            self.reconcile_dir(dir)?;
        }

        Ok(())
    }

    fn is_recent(&self, last_modified: i64) -> bool {
        self.threshold.map_or(true, |t| last_modified >= t)
    }

    /// Reconcile the children of two corresponding directories.
    fn walk(
        &mut self,
        local: Option<&CachedDir>,
        remote: Option<&CachedDir>,
    ) -> Result<(), Error> {
        let names = local
            .into_iter()
            .chain(remote)
            .flat_map(|d| d.subdirs())
            .map(|d| d.name().to_owned())
            .collect::<BTreeSet<_>>();

        for name in names {
            self.walk_dir(
                local.and_then(|d| d.get_subdir(&name)),
                remote.and_then(|d| d.get_subdir(&name)),
            )?;
        }

        Ok(())
    }

    fn walk_dir(
        &mut self,
        local: Option<&CachedDir>,
        remote: Option<&CachedDir>,
    ) -> Result<(), Error> {
        let path = match local.or(remote) {
            Some(dir) => dir.path().to_owned(),
            None => return Ok(()),
        };
        if !self.peer.in_scope(&path) {
            return Ok(());
        }

        match (DirState::of(local), DirState::of(remote)) {
            (DirState::Present(lm), DirState::Present(rm)) => {
                if self.created.contains(&path)
                    || self.is_recent(lm)
                    || self.is_recent(rm)
                {
                    self.examine.push(path);
                }
                self.walk(local, remote)
            }

            (DirState::Present(lm), DirState::Absent) => {
                self.push_dir(&path, lm, local)
            }
            (DirState::Absent, DirState::Present(rm)) => {
                self.pull_dir(&path, rm, remote)
            }

            (DirState::Present(lm), DirState::Deleted(deleted)) => {
                if deleted >= lm {
                    self.remove_local_dir(&path, deleted)
                } else {
                    self.push_dir(&path, lm, local)
                }
            }
            (DirState::Deleted(deleted), DirState::Present(rm)) => {
                if deleted >= rm {
                    self.remove_remote_dir(&path)
                } else {
                    self.pull_dir(&path, rm, remote)
                }
            }

            _ => Ok(()),
        }
    }

    fn push_dir(
        &mut self,
        path: &str,
        last_modified: i64,
        local: Option<&CachedDir>,
    ) -> Result<(), Error> {
        if !self.peer.direction.can_push() {
            return Ok(());
        }

        let result = self.client.mkdir(last_modified, path);
        if self.remote("create directory", path, result)?.is_none() {
            return Ok(());
        }

        debug!("{} Created directory {} on peer", self.log_prefix, path);
        self.report.dirs_created_remote += 1;
        self.created.insert(path.to_owned());
        self.examine.push(path.to_owned());
        self.walk(local, None)
    }

    fn pull_dir(
        &mut self,
        path: &str,
        last_modified: i64,
        remote: Option<&CachedDir>,
    ) -> Result<(), Error> {
        if !self.peer.direction.can_pull() {
            return Ok(());
        }

        let result = self.store.make_dir(path, last_modified);
        if self.local("create directory", path, result).is_none() {
            return Ok(());
        }

        debug!("{} Created directory {} locally", self.log_prefix, path);
        self.report.dirs_created_local += 1;
        self.created.insert(path.to_owned());
        self.examine.push(path.to_owned());
        self.walk(None, remote)
    }

    fn remove_local_dir(&mut self, path: &str, deleted: i64) -> Result<(), Error> {
        if !self.peer.direction.can_pull() {
            return Ok(());
        }

        let result = self.store.remove_dir(path, deleted);
        if self.local("remove directory", path, result).is_some() {
            debug!("{} Removed directory {} locally", self.log_prefix, path);
            self.report.dirs_removed_local += 1;
        }
        Ok(())
    }

    fn remove_remote_dir(&mut self, path: &str) -> Result<(), Error> {
        if !self.peer.direction.can_push() {
            return Ok(());
        }

        let result = self.client.rmdir(path);
        if self.remote("remove directory", path, result)?.is_some() {
            debug!("{} Removed directory {} on peer", self.log_prefix, path);
            self.report.dirs_removed_remote += 1;
        }
        Ok(())
    }

    /// Turn local renames into `MOVE` commands where the peer still has the
    /// file under its old name, instead of transferring it again.
    ///
    /// The peer's copy at the old name must be the exact version that was
    /// renamed here, going by modification time and length. Anything that
    /// does not line up exactly is left to the per-file pass.
    fn replay_renames(&mut self) -> Result<(), Error> {
        if !self.peer.direction.can_push() {
            return Ok(());
        }

        let examined = self.examine.iter().cloned().collect::<HashSet<_>>();
        let since = self.threshold.unwrap_or(i64::MIN);
        for (to, record) in self.store.renames(since) {
            let from = record.from;
            if !self.peer.in_scope(&to)
                || !self.peer.in_scope(&from)
                || !examined.contains(split_full_path(&to).0)
            {
                continue;
            }

            let local = match self.store.stat(&to) {
                Ok(Some(file)) if !file.is_deleted() => file,
                _ => continue,
            };

            let target = match self.look_up(&to)? {
                Some(target) => target,
                None => continue,
            };
            if target.is_some() {
                continue;
            }

            match self.look_up(&from)? {
                Some(Some(ref source))
                    if !source.is_deleted()
                        && source.timestamp() == record.last_modified
                        && source.length() == local.length() => {}
                _ => continue,
            }

            match self.client.move_file(local.timestamp(), &from, &to) {
                Ok(()) => {
                    debug!("{} Moved {} to {}", self.log_prefix, from, to);
                    self.report.moved += 1;
                }
                Err(e) if e.is_connection_level() => return Err(e),
                Err(e) => debug!(
                    "{} Failed to move {} to {}, will copy instead: {}",
                    self.log_prefix, from, to, e
                ),
            }
        }

        Ok(())
    }

    /// Look a file up on the peer. The outer `None` means the peer refused
    /// to answer.
    fn look_up(
        &mut self,
        path: &str,
    ) -> Result<Option<Option<RemoteFile>>, Error> {
        match self.client.exists(path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.is_connection_level() => Err(e),
            Err(e) => {
                debug!("{} Failed to look up {}: {}", self.log_prefix, path, e);
                Ok(None)
            }
        }
    }

    fn reconcile_dir(&mut self, dir: &str) -> Result<(), Error> {
        let result = self.client.list(0, dir);
        let remote = match self.remote("list", dir, result)? {
            Some(files) => files,
            None => return Ok(()),
        };
        let result = self.store.list(dir, 0);
        let local = match self.local("list", dir, result) {
            Some(files) => files,
            None => return Ok(()),
        };

        let mut pairs =
            BTreeMap::<String, (Option<RemoteFile>, Option<RemoteFile>)>::new();
        for file in local {
            let name = file.name().to_owned();
            pairs.entry(name).or_default().0 = Some(file);
        }
        for file in remote {
            let name = file.name().to_owned();
            pairs.entry(name).or_default().1 = Some(file);
        }

        let has_ties = pairs.values().any(|pair| match *pair {
            (Some(ref local), Some(ref remote)) => {
                !local.is_deleted()
                    && !remote.is_deleted()
                    && local.timestamp() == remote.timestamp()
            }
            _ => false,
        });
        let remote_hashes = if has_ties {
            self.remote_hashes(dir)?
        } else {
            HashMap::new()
        };

        for (name, (local, remote)) in pairs {
            let path = add_paths(dir, &name);
            if self.peer.in_scope(&path) {
                self.reconcile_file(
                    &path,
                    local.as_ref(),
                    remote.as_ref(),
                    remote_hashes.get(&name),
                )?;
            }
        }

        Ok(())
    }

    /// Fetch the peer's content hashes for `dir`. A peer that cannot answer
    /// yields an empty map, in which case ties are settled by downloading.
    fn remote_hashes(
        &mut self,
        dir: &str,
    ) -> Result<HashMap<String, ContentHash>, Error> {
        match self.client.hashes(dir) {
            Ok(hashes) => Ok(hashes.into_iter().collect()),
            Err(e) if e.is_connection_level() => Err(e),
            Err(e) => {
                debug!(
                    "{} Failed to hash {} on peer: {}",
                    self.log_prefix, dir, e
                );
                Ok(HashMap::new())
            }
        }
    }

    fn reconcile_file(
        &mut self,
        path: &str,
        local: Option<&RemoteFile>,
        remote: Option<&RemoteFile>,
        remote_hash: Option<&ContentHash>,
    ) -> Result<(), Error> {
        let (local, remote) = match (local, remote) {
            (Some(local), None) if !local.is_deleted() => {
                return self.push(path)
            }
            (None, Some(remote)) if !remote.is_deleted() => {
                return self.pull(path)
            }
            (Some(local), Some(remote)) => (local, remote),
            _ => return Ok(()),
        };

        match (local.deleted_at(), remote.deleted_at()) {
            (None, None) => {
                if local.timestamp() > remote.timestamp() {
                    self.push(path)
                } else if remote.timestamp() > local.timestamp() {
                    self.pull(path)
                } else {
                    self.settle_tie(path, remote_hash)
                }
            }

            (Some(deleted), None) => {
                if deleted >= remote.timestamp() {
                    self.delete_remote(path, deleted)
                } else {
                    self.pull(path)
                }
            }

            (None, Some(deleted)) => {
                if deleted >= local.timestamp() {
                    self.delete_local(path, deleted)
                } else {
                    self.push(path)
                }
            }

            (Some(_), Some(_)) => Ok(()),
        }
    }

    fn push(&mut self, path: &str) -> Result<(), Error> {
        if !self.peer.direction.can_push() {
            return Ok(());
        }

        let result = self.store.open_file(path);
        let (file, mut data) = match self.local("read", path, result) {
            Some(opened) => opened,
            None => return Ok(()),
        };

        let result = self.client.upload(&file, &mut data);
        if self.remote("upload", path, result)?.is_some() {
            debug!("{} Pushed {}", self.log_prefix, path);
            self.report.pushed += 1;
        }
        Ok(())
    }

    fn pull(&mut self, path: &str) -> Result<(), Error> {
        if !self.peer.direction.can_pull() {
            return Ok(());
        }

        let result = self.store.stage();
        let mut staged = match self.local("stage", path, result) {
            Some(staged) => staged,
            None => return Ok(()),
        };

        let result = self.client.download(path, staged.as_file_mut());
        let file = match self.remote("download", path, result)? {
            Some(file) => file,
            None => return Ok(()),
        };

        let result = self.store.install(staged, path, file.timestamp());
        if self.local("install", path, result).is_some() {
            debug!("{} Pulled {}", self.log_prefix, path);
            self.report.pulled += 1;
        }
        Ok(())
    }

    fn delete_remote(&mut self, path: &str, deleted: i64) -> Result<(), Error> {
        if !self.peer.direction.can_push() {
            return Ok(());
        }

        let result = self.client.delete(deleted, path);
        if self.remote("delete", path, result)?.is_some() {
            debug!("{} Deleted {} on peer", self.log_prefix, path);
            self.report.deleted_remote += 1;
        }
        Ok(())
    }

    fn delete_local(&mut self, path: &str, deleted: i64) -> Result<(), Error> {
        if !self.peer.direction.can_pull() {
            return Ok(());
        }

        let result = self.store.delete_file(path, deleted);
        if let Some(true) = self.local("delete", path, result) {
            debug!("{} Deleted {} locally", self.log_prefix, path);
            self.report.deleted_local += 1;
        }
        Ok(())
    }

    /// Settle two versions of `path` with the same timestamp. If their
    /// contents differ, the one whose content has the greater hash wins.
    fn settle_tie(
        &mut self,
        path: &str,
        remote_hash: Option<&ContentHash>,
    ) -> Result<(), Error> {
        let result = self.store.content_hash(path);
        let local_hash = match self.local("hash", path, result) {
            Some(hash) => hash,
            None => return Ok(()),
        };

        match remote_hash {
            Some(&remote_hash) => {
                if remote_hash == local_hash {
                    return Ok(());
                }

                self.note_conflict(path, local_hash, remote_hash);
                if remote_hash > local_hash {
                    self.pull(path)
                } else {
                    self.push(path)
                }
            }
            None => self.settle_tie_by_download(path, local_hash),
        }
    }

    /// Like `settle_tie`, for when the peer's hash is unknown: fetch its
    /// version and hash that instead.
    fn settle_tie_by_download(
        &mut self,
        path: &str,
        local_hash: ContentHash,
    ) -> Result<(), Error> {
        let result = self.store.stage();
        let mut staged = match self.local("stage", path, result) {
            Some(staged) => staged,
            None => return Ok(()),
        };
        let result = self.client.download(path, staged.as_file_mut());
        let remote_file = match self.remote("download", path, result)? {
            Some(file) => file,
            None => return Ok(()),
        };

        let result = staged
            .as_file_mut()
            .seek(SeekFrom::Start(0))
            .and_then(|_| hash_reader(staged.as_file_mut()))
            .map_err(Error::from);
        let remote_hash = match self.local("hash", path, result) {
            Some(hash) => hash,
            None => return Ok(()),
        };

        if remote_hash == local_hash {
            return Ok(());
        }

        self.note_conflict(path, local_hash, remote_hash);
        if remote_hash > local_hash {
            if self.peer.direction.can_pull() {
                let result =
                    self.store.install(staged, path, remote_file.timestamp());
                if self.local("install", path, result).is_some() {
                    debug!("{} Pulled {}", self.log_prefix, path);
                    self.report.pulled += 1;
                }
            }
            Ok(())
        } else {
            drop(staged);
            self.push(path)
        }
    }

    fn note_conflict(
        &mut self,
        path: &str,
        local_hash: ContentHash,
        remote_hash: ContentHash,
    ) {
        self.report.conflicts += 1;
        info!(
            "{} Conflicting versions of {}, keeping the {} one",
            self.log_prefix,
            path,
            if remote_hash > local_hash {
                "remote"
            } else {
                "local"
            }
        );
    }

    /// Handle the result of an operation on the peer. An `ERROR` answer
    /// skips the item; anything worse aborts the pass.
    fn remote<T>(
        &mut self,
        what: &str,
        path: &str,
        result: Result<T, Error>,
    ) -> Result<Option<T>, Error> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_connection_level() => Err(e),
            Err(e) => {
                warn!(
                    "{} Skipping {} of {} on peer: {}",
                    self.log_prefix, what, path, e
                );
                self.report.skipped += 1;
                Ok(None)
            }
        }
    }

    /// Handle the result of an operation on the local store. Any failure
    /// skips the item.
    fn local<T>(
        &mut self,
        what: &str,
        path: &str,
        result: Result<T, Error>,
    ) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    "{} Skipping local {} of {}: {}",
                    self.log_prefix, what, path, e
                );
                self.report.skipped += 1;
                None
            }
        }
    }
}
