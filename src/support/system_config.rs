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
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Where the synchronised Maildir tree lives.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Configuration for accepting connections from peers.
    ///
    /// If absent, this instance never serves; it only pushes to or pulls from
    /// its configured peers.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Configuration for TLS, shared by the server and outbound connections.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Timing of synchronisation passes.
    #[serde(default)]
    pub sync: SyncConfig,

    /// The peers this instance trusts.
    ///
    /// Peers not listed here are never contacted.
    #[serde(default, rename = "peer")]
    pub peers: Vec<PeerConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The root of the Maildir tree, relative to the configuration root if
    /// not absolute.
    pub path: PathBuf,
    /// How long tombstones of deleted files and directories are kept.
    ///
    /// A peer which has not synchronised for longer than this may resurrect
    /// things that were deleted in the meantime.
    pub tombstone_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: "maildir".into(),
            tombstone_retention_days: 90,
        }
    }
}

impl StorageConfig {
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.tombstone_retention_days) * 86400)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to listen on.
    pub listen: String,
    /// Whether connections must use TLS.
    pub tls: bool,
    /// If non-empty, only connections from these IP addresses are accepted.
    pub trusted_addresses: Vec<String>,
    /// Connections with no traffic for this long are dropped.
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0:7995".to_owned(),
            tls: true,
            trusted_addresses: vec![],
            idle_timeout_secs: 30 * 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: Option<PathBuf>,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: Option<PathBuf>,
    /// A PKCS#12 keystore holding the private key and certificate chain, as
    /// an alternative to `private_key` and `certificate_chain`.
    pub keystore: Option<PathBuf>,
    /// The passphrase protecting `keystore`.
    pub keystore_passphrase: String,
    /// Certificate authorities used to verify peers, in PEM format. If unset,
    /// the system defaults are used.
    pub ca_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between the starts of scheduled passes.
    pub interval_secs: u64,
    /// Read and write timeout on connections to peers.
    pub socket_timeout_secs: u64,
    /// How far the clocks of two peers may disagree.
    ///
    /// Directories modified within this much before the watermark are
    /// examined again.
    pub clock_skew_allowance_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            interval_secs: 300,
            socket_timeout_secs: 60,
            clock_skew_allowance_secs: 300,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs.max(1))
    }

    pub fn clock_skew_allowance_ms(&self) -> i64 {
        (self.clock_skew_allowance_secs as i64).saturating_mul(1000)
    }
}

/// Which side of a peer relationship may be modified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Only the peer is changed to match the local tree.
    Push,
    /// Only the local tree is changed to match the peer.
    Pull,
    /// Changes flow both ways.
    Both,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Both
    }
}

impl Direction {
    pub fn can_push(self) -> bool {
        matches!(self, Direction::Push | Direction::Both)
    }

    pub fn can_pull(self) -> bool {
        matches!(self, Direction::Pull | Direction::Both)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Direction::Push => "push",
            Direction::Pull => "pull",
            Direction::Both => "both",
        })
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "push" => Ok(Direction::Push),
            "pull" => Ok(Direction::Pull),
            "both" => Ok(Direction::Both),
            _ => Err(format!(
                "Invalid direction '{}'; expected push, pull or both",
                s
            )),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PeerConfig {
    /// The name used to refer to this peer on the command line and in logs.
    /// It also keys the watermark, so renaming a peer causes a full pass.
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Skip verification of the peer's certificate.
    #[serde(default)]
    pub allow_insecure_tls: bool,
    #[serde(default)]
    pub direction: Direction,
    /// Path prefixes to synchronise. Empty means everything.
    #[serde(default)]
    pub scope: Vec<String>,
}

pub const DEFAULT_PORT: u16 = 7995;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

impl PeerConfig {
    /// Build an ad-hoc peer for a `host:port` given on the command line.
    pub fn ad_hoc(host: String, port: u16, direction: Direction) -> Self {
        PeerConfig {
            name: format!("{}:{}", host, port),
            host,
            port,
            tls: true,
            allow_insecure_tls: false,
            direction,
            scope: vec![],
        }
    }

    /// Whether `path` falls within this peer's scope.
    ///
    /// Ancestors of scoped paths are also in scope, since they must exist for
    /// the scoped paths to exist.
    pub fn in_scope(&self, path: &str) -> bool {
        self.scope.is_empty()
            || self.scope.iter().any(|prefix| {
                let prefix = prefix.trim_matches('/');
                is_path_prefix(prefix, path) || is_path_prefix(path, prefix)
            })
    }
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix)
            && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}
