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

use std::path::{Path, PathBuf};

use super::main::*;
use crate::support::chronox::format_ms;
use crate::support::error::Error;
use crate::support::sysexits::*;
use crate::support::system_config::{Direction, PeerConfig, SystemConfig};
use crate::sync::scheduler::PeerSession;

pub(super) fn sync(
    system_config: SystemConfig,
    root: PathBuf,
    cmd: SyncSubcommand,
) {
    let peer = resolve_peer(&system_config, &cmd.peer, cmd.direction);
    let store = open_store(&system_config, &root);
    let mut session = open_session(&system_config, &root, &peer);

    match session.pass(&store, system_config.sync.clock_skew_allowance_ms())
    {
        Ok(report) => println!("{}: {}", peer.name, report),
        Err(e) => {
            eprintln!("Sync with {} failed: {}", peer.name, e);
            Sysexit::for_error(&e).exit()
        }
    }
}

pub(super) fn remote(
    system_config: SystemConfig,
    root: PathBuf,
    cmd: RemoteSubcommand,
) {
    let result = match cmd {
        RemoteSubcommand::Dir(options) => {
            let peer = resolve_peer(&system_config, &options, None);
            let mut session = open_session(&system_config, &root, &peer);
            print_dirs(&mut session)
        }
        RemoteSubcommand::List(cmd) => {
            let peer = resolve_peer(&system_config, &cmd.peer, None);
            let mut session = open_session(&system_config, &root, &peer);
            print_files(&mut session, cmd.since, &cmd.path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        Sysexit::for_error(&e).exit()
    }
}

fn print_dirs(session: &mut PeerSession) -> Result<(), Error> {
    let dirs = session.client_mut().dir()?;
    for dir in dirs.iter() {
        if dir.path().is_empty() {
            continue;
        }

        match dir.deleted_at() {
            Some(at) => {
                println!("{}  deleted {}", dir.path(), describe_deletion(at))
            }
            None => println!(
                "{}  modified {}",
                dir.path(),
                format_ms(dir.last_modified())
            ),
        }
    }
    session.client_mut().disconnect();
    Ok(())
}

fn print_files(
    session: &mut PeerSession,
    since_secs: i64,
    path: &str,
) -> Result<(), Error> {
    let files = session
        .client_mut()
        .list(since_secs.saturating_mul(1000), path)?;
    for file in files {
        match file.deleted_at() {
            Some(at) => println!(
                "{}  deleted {}",
                file.full_path(),
                describe_deletion(at)
            ),
            None => println!(
                "{}  {} bytes  modified {}",
                file.full_path(),
                file.length(),
                format_ms(file.timestamp())
            ),
        }
    }
    session.client_mut().disconnect();
    Ok(())
}

fn describe_deletion(at: i64) -> String {
    if at <= 1000 {
        "at an unknown time".to_owned()
    } else {
        format_ms(at)
    }
}

fn open_session(
    system_config: &SystemConfig,
    root: &Path,
    peer: &PeerConfig,
) -> PeerSession {
    let identity = load_identity(system_config, root);
    match PeerSession::open(peer, system_config, root, identity.as_ref()) {
        Ok(session) => session,
        Err(e) => {
            die!(EX_CONFIG, "Unable to set up TLS for {}: {}", peer.name, e)
        }
    }
}

/// Find the peer named `options.peer`, or build an ad-hoc one if it looks like
/// `host:port`.
///
/// Watermarks are kept per peer name, and a pass that only goes one way does
/// not look at changes in the other direction, so narrowing the direction on
/// the command line also gives the peer a distinct name.
fn resolve_peer(
    system_config: &SystemConfig,
    options: &PeerOptions,
    direction: Option<Direction>,
) -> PeerConfig {
    let mut peer = match system_config
        .peers
        .iter()
        .find(|p| p.name == options.peer)
    {
        Some(peer) => peer.clone(),
        None => match parse_host_port(&options.peer) {
            Some((host, port)) => {
                PeerConfig::ad_hoc(host, port, Direction::Both)
            }
            None => die!(
                EX_NOHOST,
                "'{}' is neither a configured peer nor host:port",
                options.peer
            ),
        },
    };

    if let Some(direction) = direction {
        if direction != peer.direction {
            peer.name = format!("{}+{}", peer.name, direction);
            peer.direction = direction;
        }
    }

    if options.allow_insecure_tls_connections {
        peer.allow_insecure_tls = true;
    }

    peer
}

fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let colon = s.rfind(':')?;
    let host = s[..colon].trim_start_matches('[').trim_end_matches(']');
    let port = s[colon + 1..].parse::<u16>().ok()?;
    if host.is_empty() {
        None
    } else {
        Some((host.to_owned(), port))
    }
}
