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

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};
use openssl::ssl::SslAcceptor;

use super::main::{load_identity, open_store};
use crate::store::tree::MaildirTree;
use crate::support::sysexits::Sysexit;
use crate::support::system_config::{ServerConfig, SystemConfig};
use crate::support::tls::Identity;
use crate::sync::scheduler::{PeerSession, Scheduler};
use crate::sync::server::Listener;

// Need to use a this and not die! so that errors go to syslog/etc
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

pub(super) fn serve(system_config: SystemConfig, root: PathBuf) {
    let server_config = match system_config.server {
        Some(ref server_config) => server_config,
        None => fatal!(EX_CONFIG, "No [server] section is configured"),
    };

    let store = Arc::new(open_store(&system_config, &root));
    let identity = load_identity(&system_config, &root);
    let listener = bind(server_config, store, identity.as_ref());
    run_listener(&listener);
}

pub(super) fn daemon(system_config: SystemConfig, root: PathBuf) {
    let store = Arc::new(open_store(&system_config, &root));
    let identity = load_identity(&system_config, &root);

    let listener = system_config.server.as_ref().map(|server_config| {
        bind(server_config, Arc::clone(&store), identity.as_ref())
    });

    if system_config.peers.is_empty() {
        match listener {
            Some(listener) => run_listener(&listener),
            None => fatal!(
                EX_CONFIG,
                "Nothing to do: no [server] section and no peers"
            ),
        }
        return;
    }

    let sessions = system_config
        .peers
        .iter()
        .map(|peer| {
            match PeerSession::open(
                peer,
                &system_config,
                &root,
                identity.as_ref(),
            ) {
                Ok(session) => session,
                Err(e) => fatal!(
                    EX_CONFIG,
                    "Unable to set up connection to {}: {}",
                    peer.name,
                    e
                ),
            }
        })
        .collect::<Vec<_>>();

    if let Some(listener) = listener {
        thread::spawn(move || run_listener(&listener));
    }

    Scheduler::new(store, sessions, &system_config.sync).run()
}

fn bind(
    server_config: &ServerConfig,
    store: Arc<MaildirTree>,
    identity: Option<&Identity>,
) -> Listener {
    let acceptor = if server_config.tls {
        Some(create_ssl_acceptor(identity))
    } else {
        warn!("Serving without TLS; peers are not authenticated");
        None
    };

    match Listener::bind(server_config, store, acceptor) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to listen on {}: {}", server_config.listen, e);
            Sysexit::for_error(&e).exit()
        }
    }
}

fn create_ssl_acceptor(identity: Option<&Identity>) -> SslAcceptor {
    let identity = match identity {
        Some(identity) => identity,
        None => fatal!(
            EX_CONFIG,
            "[server] requires TLS, but [tls] names no private key \
             and certificate or keystore"
        ),
    };

    match identity.acceptor() {
        Ok(acceptor) => acceptor,
        Err(e) => fatal!(EX_CONFIG, "TLS identity seems to be invalid: {}", e),
    }
}

fn run_listener(listener: &Listener) {
    if let Err(e) = listener.run() {
        fatal!(EX_IOERR, "Listener failed: {}", e);
    }
    info!("Listener stopped");
}
