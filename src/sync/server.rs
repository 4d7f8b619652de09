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

//! The serving side of the synchronisation protocol.
//!
//! A `Server` interprets the commands of one connection against the local
//! `MaildirTree`. A `Listener` accepts TCP connections, optionally wraps
//! them in TLS, and runs a `Server` for each on its own thread.

use std::io::{self, BufReader, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use openssl::ssl::SslAcceptor;

use super::protocol::{
    escape_path, format_dir_line, format_file_header, format_hash_line,
    format_list_line, looks_like_known_command, read_line, write_line, Command,
    ReadWrite, GREETING,
};
use super::remote_file::split_full_path;
use crate::store::tree::MaildirTree;
use crate::support::chronox::now_seconds_ms;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::log_prefix::LogPrefix;
use crate::support::safe_name::is_safe_path;
use crate::support::system_config::ServerConfig;

/// The largest file a peer may `PUT`.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

pub struct Server {
    stream: BufReader<Box<dyn ReadWrite>>,
    store: Arc<MaildirTree>,
    log_prefix: LogPrefix,
}

impl Server {
    pub fn new(
        stream: Box<dyn ReadWrite>,
        store: Arc<MaildirTree>,
        log_prefix: LogPrefix,
    ) -> Self {
        Server {
            stream: BufReader::new(stream),
            store,
            log_prefix,
        }
    }

    /// Serve the connection until the client goes away.
    ///
    /// The client closing the connection between commands is a normal end
    /// and returns `Ok`. The manifest is flushed either way.
    pub fn run(&mut self) -> Result<(), Error> {
        let result = self.send(GREETING).and_then(|_| self.serve());
        if let Err(e) = self.store.flush() {
            error!("{} Failed to save sync state: {}", self.log_prefix, e);
        }

        result
    }

    fn serve(&mut self) -> Result<(), Error> {
        loop {
            let line = match read_line(&mut self.stream) {
                Ok(line) => line,
                Err(Error::Io(ref e))
                    if io::ErrorKind::UnexpectedEof == e.kind() =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e),
            };
            trace!("{} << {}", self.log_prefix, line);

            match line.parse::<Command>() {
                Ok(command) => self.dispatch(command)?,
                Err(()) if looks_like_known_command(&line) => {
                    self.send("ERROR Bad arguments")?
                }
                Err(()) => self.send("ERROR Unknown command")?,
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::Dir => self.cmd_dir(),
            Command::List { since, path } => self.cmd_list(since, &path),
            Command::Hash { path } => self.cmd_hash(&path),
            Command::Put {
                last_modified,
                size,
                path,
            } => self.cmd_put(last_modified, size, &path),
            Command::Get { path } => self.cmd_get(&path),
            Command::Move { time, from, to } => {
                let result = self.store.move_file(&from, &to, time);
                self.finish(result)
            }
            Command::Exists { path } => self.cmd_exists(&path),
            Command::Delete { deleted, path } => {
                let result = self.store.delete_file(&path, deleted).map(|_| ());
                self.finish(result)
            }
            Command::Mkdir {
                last_modified,
                path,
            } => {
                let result = self.store.make_dir(&path, last_modified);
                self.finish(result)
            }
            Command::Rmdir { path } => {
                let result = self.store.remove_dir(&path, now_seconds_ms());
                self.finish(result)
            }
            Command::Touch {
                last_modified,
                path,
            } => {
                let result = self.store.touch(&path, last_modified);
                self.finish(result)
            }
        }
    }

    fn cmd_dir(&mut self) -> Result<(), Error> {
        if let Err(e) = self.store.scan() {
            return self.send_error(e);
        }

        let tree = self.store.dir_tree();
        let lines = tree.iter().map(format_dir_line).collect::<Vec<_>>();
        self.send_payload(&lines)
    }

    fn cmd_list(&mut self, since: i64, path: &str) -> Result<(), Error> {
        match self.store.list(path, since) {
            Ok(files) => {
                let lines =
                    files.iter().map(format_list_line).collect::<Vec<_>>();
                self.send_payload(&lines)
            }
            Err(e) => self.send_error(e),
        }
    }

    fn cmd_hash(&mut self, path: &str) -> Result<(), Error> {
        match self.store.hashes(path) {
            Ok(hashes) => {
                let lines = hashes
                    .iter()
                    .map(|(name, hash)| format_hash_line(name, hash))
                    .collect::<Vec<_>>();
                self.send_payload(&lines)
            }
            Err(e) => self.send_error(e),
        }
    }

    fn cmd_put(
        &mut self,
        last_modified: i64,
        size: u64,
        path: &str,
    ) -> Result<(), Error> {
        if !is_safe_path(path) || split_full_path(path).0.is_empty() {
            return self.send_error(Error::UnsafeName);
        }

        if size > MAX_FILE_SIZE {
            return self.send("ERROR File too large");
        }

        let mut staged = match self.store.stage() {
            Ok(staged) => staged,
            Err(e) => return self.send_error(e),
        };

        self.send("RECEIVING")?;
        trace!("{} << [{} bytes]", self.log_prefix, size);
        // Once RECEIVING is sent there is no way to resynchronise with the
        // client if the payload is cut short, so any failure here ends the
        // connection.
        file_ops::copy_exact(&mut self.stream, staged.as_file_mut(), size)?;

        let result = self.store.install(staged, path, last_modified);
        if result.is_ok() {
            debug!("{} Received {}", self.log_prefix, path);
        }
        self.finish(result)
    }

    fn cmd_get(&mut self, path: &str) -> Result<(), Error> {
        let (file, mut data) = match self.store.open_file(path) {
            Ok(opened) => opened,
            Err(e) => return self.send_error(e),
        };

        let header = format_file_header(&file, false);
        trace!("{} >> {}", self.log_prefix, header);
        trace!("{} >> [{} bytes]", self.log_prefix, file.length());
        let w = self.stream.get_mut();
        let mut buf = Vec::with_capacity(header.len() + 1);
        buf.extend_from_slice(header.as_bytes());
        buf.push(b'\n');
        w.write_all(&buf)?;
        // The header promised exactly this many bytes, so a file that
        // shrinks underneath us has to kill the connection.
        file_ops::copy_exact(&mut data, w, file.length() as u64)?;
        self.send("READY")
    }

    fn cmd_exists(&mut self, path: &str) -> Result<(), Error> {
        match self.store.stat(path) {
            Ok(Some(file)) => {
                self.send_payload(&[format_file_header(&file, true)])
            }
            Ok(None) => {
                let line = format!("MISSING {}", escape_path(path));
                self.send(&line)
            }
            Err(e) => self.send_error(e),
        }
    }

    /// Answer a command whose only result is success or failure.
    fn finish(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        match result {
            Ok(()) => self.send("READY"),
            Err(e) => self.send_error(e),
        }
    }

    fn send_error(&mut self, e: Error) -> Result<(), Error> {
        warn!("{} Command failed: {}", self.log_prefix, e);
        let message = e
            .to_string()
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect::<String>();
        self.send(&format!("ERROR {}", message))
    }

    /// Send `lines` followed by `READY`, in one write.
    fn send_payload(&mut self, lines: &[String]) -> Result<(), Error> {
        let mut out = String::new();
        for line in lines {
            trace!("{} >> {}", self.log_prefix, line);
            out.push_str(line);
            out.push('\n');
        }
        trace!("{} >> READY", self.log_prefix);
        out.push_str("READY");
        write_line(self.stream.get_mut(), &out)?;
        Ok(())
    }

    fn send(&mut self, line: &str) -> Result<(), Error> {
        trace!("{} >> {}", self.log_prefix, line);
        write_line(self.stream.get_mut(), line)?;
        Ok(())
    }
}

/// Accepts connections from peers.
pub struct Listener {
    listener: TcpListener,
    store: Arc<MaildirTree>,
    acceptor: Option<SslAcceptor>,
    trusted: Vec<IpAddr>,
    idle_timeout: Duration,
}

impl Listener {
    /// Bind to the address in `config`.
    ///
    /// If `acceptor` is given, every connection must complete a TLS
    /// handshake before it is served.
    pub fn bind(
        config: &ServerConfig,
        store: Arc<MaildirTree>,
        acceptor: Option<SslAcceptor>,
    ) -> Result<Self, Error> {
        let trusted = config
            .trusted_addresses
            .iter()
            .map(|a| {
                a.parse::<IpAddr>().map_err(|_| {
                    Error::Config(format!("Bad trusted address: {}", a))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let listener = TcpListener::bind(&config.listen)?;
        Ok(Listener {
            listener,
            store,
            acceptor,
            trusted,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections forever.
    pub fn run(&self) -> Result<(), Error> {
        info!(
            "Listening for sync connections on {}",
            self.local_addr()?
        );

        loop {
            let (stream, origin) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let log_prefix = LogPrefix::new("sync-server".to_owned());
            log_prefix.set_address(origin.to_string());

            if !self.trusted.is_empty() && !self.trusted.contains(&origin.ip())
            {
                warn!("{} Refusing untrusted connection", log_prefix);
                continue;
            }

            let store = Arc::clone(&self.store);
            let acceptor = self.acceptor.clone();
            let idle_timeout = self.idle_timeout;
            thread::spawn(move || {
                handle_connection(
                    stream,
                    store,
                    acceptor,
                    idle_timeout,
                    log_prefix,
                )
            });
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    store: Arc<MaildirTree>,
    acceptor: Option<SslAcceptor>,
    idle_timeout: Duration,
    log_prefix: LogPrefix,
) {
    if let Err(e) = stream
        .set_read_timeout(Some(idle_timeout))
        .and_then(|_| stream.set_write_timeout(Some(idle_timeout)))
    {
        warn!("{} Failed to configure socket: {}", log_prefix, e);
        return;
    }

    let stream: Box<dyn ReadWrite> = match acceptor {
        None => Box::new(stream),
        Some(acceptor) => match acceptor.accept(stream) {
            Ok(stream) => Box::new(stream),
            Err(e) => {
                warn!("{} TLS handshake failed: {}", log_prefix, e);
                return;
            }
        },
    };

    info!("{} Connection established", log_prefix);
    match Server::new(stream, store, log_prefix.clone()).run() {
        Ok(()) => info!("{} Normal client disconnect", log_prefix),
        Err(e) => warn!("{} Abnormal client disconnect: {}", log_prefix, e),
    }
}
