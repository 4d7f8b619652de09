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

//! Runs passes against the configured peers.
//!
//! Each peer gets a `PeerSession`, which keeps its `SyncClient` (and so its
//! connection) from one pass to the next. A scheduled round runs one pass
//! per peer, each on its own thread; the passes share the local store.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use rand::Rng;

use super::client::{SyncClient, TcpConnector};
use super::reconcile::{run_pass, PassReport};
use crate::store::tree::MaildirTree;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::{PeerConfig, SyncConfig, SystemConfig};
use crate::support::tls::{self, Identity};

pub struct PeerSession {
    peer: PeerConfig,
    client: SyncClient,
    log_prefix: LogPrefix,
}

impl PeerSession {
    pub fn new(peer: PeerConfig, client: SyncClient, log_prefix: LogPrefix) -> Self {
        PeerSession {
            peer,
            client,
            log_prefix,
        }
    }

    /// Build a session for `peer`, connecting with the TLS settings of
    /// `config`. `identity`, if any, is presented as a client certificate.
    ///
    /// Nothing is connected until the first pass.
    pub fn open(
        peer: &PeerConfig,
        config: &SystemConfig,
        root: &Path,
        identity: Option<&Identity>,
    ) -> Result<Self, Error> {
        let tls = if peer.tls {
            Some(tls::connector(
                &config.tls,
                root,
                identity,
                peer.allow_insecure_tls,
            )?)
        } else {
            None
        };

        let log_prefix = LogPrefix::new("sync-client".to_owned());
        log_prefix.set_peer(peer.name.clone());
        let connector = TcpConnector::new(
            peer.host.clone(),
            peer.port,
            config.sync.socket_timeout(),
            tls,
        );
        let client = SyncClient::new(Box::new(connector), log_prefix.clone());
        Ok(PeerSession::new(peer.clone(), client, log_prefix))
    }

    pub fn name(&self) -> &str {
        &self.peer.name
    }

    /// The client, for inspecting the peer outside of a pass.
    pub fn client_mut(&mut self) -> &mut SyncClient {
        &mut self.client
    }

    /// Run one pass against this peer.
    ///
    /// A failed pass drops the connection so the next one starts clean.
    pub fn pass(
        &mut self,
        store: &MaildirTree,
        clock_skew_allowance_ms: i64,
    ) -> Result<PassReport, Error> {
        let result = run_pass(
            store,
            &mut self.client,
            &self.peer,
            clock_skew_allowance_ms,
            &self.log_prefix,
        );
        if result.is_err() {
            self.client.disconnect();
        }
        result
    }
}

pub struct Scheduler {
    store: Arc<MaildirTree>,
    sessions: Vec<PeerSession>,
    interval: Duration,
    clock_skew_allowance_ms: i64,
}

impl Scheduler {
    pub fn new(
        store: Arc<MaildirTree>,
        sessions: Vec<PeerSession>,
        config: &SyncConfig,
    ) -> Self {
        Scheduler {
            store,
            sessions,
            interval: config.interval(),
            clock_skew_allowance_ms: config.clock_skew_allowance_ms(),
        }
    }

    /// Run one pass against every peer concurrently and wait for them all.
    ///
    /// Returns the outcome for each peer by name. A pass whose thread
    /// panicked is logged and left out.
    pub fn run_once(&mut self) -> Vec<(String, Result<PassReport, Error>)> {
        let store = &*self.store;
        let skew = self.clock_skew_allowance_ms;
        let sessions = &mut self.sessions;

        let outcome = crossbeam::scope(|s| {
            let handles = sessions
                .iter_mut()
                .map(|session| {
                    s.spawn(move |_| {
                        let result = session.pass(store, skew);
                        (session.name().to_owned(), result)
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(outcome) => Some(outcome),
                    Err(_) => {
                        error!("Sync thread panicked");
                        None
                    }
                })
                .collect::<Vec<_>>()
        });

        outcome.unwrap_or_else(|_| {
            error!("Sync thread panicked");
            Vec::new()
        })
    }

    /// Run a round every interval, forever. Failures are logged and the
    /// next round proceeds as usual.
    pub fn run(&mut self) -> ! {
        info!(
            "Synchronising with {} peer(s) every {:?}",
            self.sessions.len(),
            self.interval
        );

        loop {
            let started = Instant::now();
            for (name, result) in self.run_once() {
                if let Err(e) = result {
                    warn!("Pass with {} failed: {}", name, e);
                }
            }

            let delay = jittered(self.interval);
            if let Some(remaining) = delay.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }
}

/// `interval` plus up to 10% more, so that peers on the same schedule drift
/// apart.
fn jittered(interval: Duration) -> Duration {
    let max_jitter = (interval.as_millis() / 10) as u64;
    if 0 == max_jitter {
        interval
    } else {
        interval
            + Duration::from_millis(
                rand::thread_rng().gen_range(0, max_jitter + 1),
            )
    }
}
