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

use std::fs;
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::store::tree::MaildirTree;
use crate::support::sysexits::*;
use crate::support::system_config::{Direction, SystemConfig};
use crate::support::tls::Identity;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Accept connections from peers until killed.
    ///
    /// Requires a `[server]` section in the configuration.
    Serve(CommonOptions),
    Sync(SyncSubcommand),
    /// Serve peers and periodically synchronise with every configured peer.
    ///
    /// The server only runs if `[server]` is configured. Each peer gets its
    /// own thread and connection; a failed pass is logged and retried at the
    /// next interval.
    Daemon(CommonOptions),
    /// Inspect a peer's tree without changing anything.
    Remote(RemoteSubcommand),
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Serve(ref mut c) | Command::Daemon(ref mut c) => {
                mem::take(c)
            }
            Command::Sync(ref mut c) => mem::take(&mut c.peer.common),
            Command::Remote(RemoteSubcommand::Dir(ref mut c)) => {
                mem::take(&mut c.common)
            }
            Command::Remote(RemoteSubcommand::List(ref mut c)) => {
                mem::take(&mut c.peer.common)
            }
        }
    }
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `crymap-sync.toml` etc
    /// [default: /etc/crymap-sync or /usr/local/etc/crymap-sync]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt, Default)]
pub(super) struct PeerOptions {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Allow insecure TLS connections
    #[structopt(long)]
    pub(super) allow_insecure_tls_connections: bool,

    /// The name of a configured peer, or `host:port` for any other
    pub(super) peer: String,
}

/// Run one synchronisation pass against a peer, then exit.
///
/// A peer not named in the configuration can be given as `host:port`; it is
/// contacted over TLS and its whole tree is in scope.
///
/// The exit status is 0 if the pass completed (even if some individual files
/// were skipped), EX_TEMPFAIL if it failed for a reason the next pass may
/// not share, and something more specific otherwise.
#[derive(StructOpt)]
pub(super) struct SyncSubcommand {
    #[structopt(flatten)]
    pub(super) peer: PeerOptions,

    /// Only let changes flow this way (push, pull or both), instead of the
    /// configured direction.
    #[structopt(long, short, parse(try_from_str))]
    pub(super) direction: Option<Direction>,
}

#[derive(StructOpt)]
pub(super) enum RemoteSubcommand {
    /// List every directory and directory tombstone the peer knows of.
    Dir(PeerOptions),
    List(RemoteListSubcommand),
}

/// List the files and file tombstones in one of the peer's directories.
#[derive(StructOpt)]
pub(super) struct RemoteListSubcommand {
    #[structopt(flatten)]
    pub(super) peer: PeerOptions,

    /// Only list entries changed at or after this UNIX time, in seconds
    #[structopt(long, default_value = "0")]
    pub(super) since: i64,

    /// The directory to list, relative to the root of the tree
    pub(super) path: String,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let mut cmd = Command::from_clap(&match Command::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let common = cmd.common_options();
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/crymap-sync/crymap-sync.toml").is_file() {
            "/etc/crymap-sync".to_owned().into()
        } else if Path::new("/usr/local/etc/crymap-sync/crymap-sync.toml")
            .is_file()
        {
            "/usr/local/etc/crymap-sync".to_owned().into()
        } else {
            die!(
                EX_CONFIG,
                "Neither /etc/crymap-sync nor /usr/local/etc/crymap-sync \
                 looks like\nthe crymap-sync root; use \
                 --root=/path/to/crymap-sync if your\ninstallation is \
                 elsewhere."
            )
        }
    });

    let system_config = load_config(&root);
    init_logging(&root);

    match cmd {
        Command::Serve(_) => super::serve::serve(system_config, root),
        Command::Daemon(_) => super::serve::daemon(system_config, root),
        Command::Sync(cmd) => super::sync::sync(system_config, root, cmd),
        Command::Remote(cmd) => super::sync::remote(system_config, root, cmd),
    }
}

fn load_config(root: &Path) -> SystemConfig {
    let system_config_path = root.join("crymap-sync.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        die!(
            EX_CONFIG,
            "Error reading '{}': {}",
            system_config_path.display(),
            e
        );
    }

    match toml::from_slice(&system_config_toml) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            system_config_path.display(),
            e
        ),
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    // log4rs *or* syslog, since there is no maintained bridge between the
    // two.
    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => die!(EX_UNAVAILABLE, "Failed to connect to syslog: {}", e),
        };
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
        {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
    }
}

/// Open the store named by `[storage]`, which is relative to `root` unless
/// absolute.
pub(super) fn open_store(
    system_config: &SystemConfig,
    root: &Path,
) -> MaildirTree {
    let path = root.join(&system_config.storage.path);
    match MaildirTree::open(
        &path,
        system_config.storage.tombstone_retention(),
    ) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Unable to open '{}': {}", path.display(), e);
            Sysexit::for_error(&e).exit()
        }
    }
}

pub(super) fn load_identity(
    system_config: &SystemConfig,
    root: &Path,
) -> Option<Identity> {
    match Identity::load(&system_config.tls, root) {
        Ok(identity) => identity,
        Err(e) => die!(EX_CONFIG, "Unable to load TLS identity: {}", e),
    }
}
