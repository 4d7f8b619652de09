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

//! Shared fixtures for the integration tests.
//!
//! A `Node` is a store in its own temporary directory with a real server
//! listening on a loopback port, so passes between nodes exercise the whole
//! client, protocol, server and store stack.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

pub use crate::store::tree::MaildirTree;
pub use crate::support::error::Error;
pub use crate::support::system_config::{Direction, PeerConfig};
pub use crate::sync::reconcile::{run_pass, PassReport};
use crate::support::file_ops;
use crate::support::log_prefix::LogPrefix;
use crate::support::safe_name::STATE_DIR_NAME;
use crate::support::system_config::ServerConfig;
use crate::support::tls;
use crate::sync::cached_dir::add_paths;
use crate::sync::client::{SyncClient, TcpConnector};
use crate::sync::scheduler::PeerSession;
use crate::sync::server::Listener;

/// Small enough that the directory pre-filter actually skips things, large
/// enough to cover coarse file system timestamps.
pub const SKEW_MS: i64 = 1000;

pub struct Node {
    pub name: &'static str,
    pub store: Arc<MaildirTree>,
    pub address: SocketAddr,
    pub tls: bool,
    root: TempDir,
}

pub fn node(name: &'static str) -> Node {
    start_node(name, false)
}

pub fn tls_node(name: &'static str) -> Node {
    start_node(name, true)
}

fn start_node(name: &'static str, tls: bool) -> Node {
    crate::init_test_log();

    let root = TempDir::new().unwrap();
    let store = Arc::new(
        MaildirTree::open(root.path(), Duration::from_secs(90 * 86400))
            .unwrap(),
    );
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_owned(),
        tls,
        trusted_addresses: vec![],
        idle_timeout_secs: 60,
    };
    let acceptor = if tls {
        Some(tls::test_identity::identity().acceptor().unwrap())
    } else {
        None
    };
    let listener = Listener::bind(&config, Arc::clone(&store), acceptor).unwrap();
    let address = listener.local_addr().unwrap();
    thread::spawn(move || listener.run());

    Node {
        name,
        store,
        address,
        tls,
        root,
    }
}

/// A session with a peer that refuses all connections.
pub fn unreachable_peer(name: &str) -> PeerSession {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    session_for(PeerConfig {
        name: name.to_owned(),
        tls: false,
        ..PeerConfig::ad_hoc("127.0.0.1".to_owned(), port, Direction::Both)
    })
}

fn session_for(peer: PeerConfig) -> PeerSession {
    let log_prefix = LogPrefix::new("sync-client".to_owned());
    log_prefix.set_peer(peer.name.clone());
    let client = client_for(&peer, log_prefix.clone());
    PeerSession::new(peer, client, log_prefix)
}

fn client_for(peer: &PeerConfig, log_prefix: LogPrefix) -> SyncClient {
    let tls = if peer.tls {
        Some(
            tls::connector(&Default::default(), Path::new("/"), None, true)
                .unwrap(),
        )
    } else {
        None
    };
    let connector = TcpConnector::new(
        peer.host.clone(),
        peer.port,
        Duration::from_secs(10),
        tls,
    );
    SyncClient::new(Box::new(connector), log_prefix)
}

impl Node {
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// This node as a peer.
    pub fn peer(&self, direction: Direction) -> PeerConfig {
        PeerConfig {
            name: self.name.to_owned(),
            tls: self.tls,
            allow_insecure_tls: self.tls,
            ..PeerConfig::ad_hoc(
                "127.0.0.1".to_owned(),
                self.address.port(),
                direction,
            )
        }
    }

    pub fn client(&self) -> SyncClient {
        let log_prefix = LogPrefix::new("sync-client".to_owned());
        log_prefix.set_peer(self.name.to_owned());
        client_for(&self.peer(Direction::Both), log_prefix)
    }

    pub fn session(&self, direction: Direction) -> PeerSession {
        session_for(self.peer(direction))
    }

    /// Run one pass from this node against `remote`.
    pub fn sync(&self, remote: &Node, direction: Direction) -> PassReport {
        self.try_sync(remote, &remote.peer(direction)).unwrap()
    }

    pub fn try_sync(
        &self,
        remote: &Node,
        peer: &PeerConfig,
    ) -> Result<PassReport, Error> {
        let log_prefix = LogPrefix::new(self.name.to_owned());
        log_prefix.set_peer(remote.name.to_owned());
        let mut client = remote.client();
        run_pass(&self.store, &mut client, peer, SKEW_MS, &log_prefix)
    }

    /// Write a file straight into the tree with a modification time in
    /// seconds, the way a local delivery agent would.
    pub fn put(&self, path: &str, data: &[u8], mtime: i64) {
        let abs = self.root().join(path);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, data).unwrap();
        file_ops::set_mtime(&abs, mtime * 1000).unwrap();
    }

    pub fn remove(&self, path: &str) {
        fs::remove_file(self.root().join(path)).unwrap();
    }

    pub fn remove_dir(&self, path: &str) {
        fs::remove_dir_all(self.root().join(path)).unwrap();
    }

    pub fn rename(&self, from: &str, to: &str) {
        let to = self.root().join(to);
        fs::create_dir_all(to.parent().unwrap()).unwrap();
        fs::rename(self.root().join(from), to).unwrap();
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        fs::read(self.root().join(path)).ok()
    }

    /// The modification time of `path`, in seconds.
    pub fn mtime(&self, path: &str) -> i64 {
        let md = fs::metadata(self.root().join(path)).unwrap();
        crate::support::chronox::system_time_ms(md.modified().unwrap()) / 1000
    }

    /// Every file in the tree, by path.
    pub fn contents(&self) -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        collect(self.root(), "", &mut files, &mut dirs);
        files
    }

    /// Every directory in the tree.
    pub fn dirs(&self) -> BTreeSet<String> {
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        collect(self.root(), "", &mut files, &mut dirs);
        dirs
    }
}

fn collect(
    dir: &Path,
    prefix: &str,
    files: &mut BTreeMap<String, Vec<u8>>,
    dirs: &mut BTreeSet<String>,
) {
    for entry in fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().into_string().unwrap();
        if prefix.is_empty() && STATE_DIR_NAME == name {
            continue;
        }

        let path = add_paths(prefix, &name);
        if entry.file_type().unwrap().is_dir() {
            dirs.insert(path.clone());
            collect(&entry.path(), &path, files, dirs);
        } else {
            files.insert(path, fs::read(entry.path()).unwrap());
        }
    }
}
