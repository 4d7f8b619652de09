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

//! The client side of the synchronisation protocol.
//!
//! A `SyncClient` owns at most one connection to one peer. It connects
//! lazily, and every command goes through `begin`, which writes the command
//! and reads the first response line; if either fails with an I/O or TLS
//! error, the connection is dropped and the whole thing is tried exactly once more.
//! Bulk payloads (the bytes after `RECEIVING` or a `FILE` header) are never
//! retried, since by then the peer may have acted on the command.

use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, trace, warn};
use openssl::ssl::{HandshakeError, SslConnector};

use super::cached_dir::CachedDirs;
use super::protocol::{
    parse_dir_line, parse_file_header, parse_hash_line, parse_list_line,
    read_line, write_line, Command, ReadWrite, Response,
};
use super::remote_file::RemoteFile;
use crate::store::tree::ContentHash;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::log_prefix::LogPrefix;

/// Opens fresh byte streams to one peer.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn ReadWrite>, Error>;
    /// A human-readable description of where this connects, for logging.
    fn address(&self) -> String;
}

/// Connects over TCP, optionally wrapped in TLS.
pub struct TcpConnector {
    host: String,
    port: u16,
    timeout: Duration,
    tls: Option<SslConnector>,
}

impl TcpConnector {
    /// `timeout` bounds the connection attempt and every later read and
    /// write.
    pub fn new(
        host: String,
        port: u16,
        timeout: Duration,
        tls: Option<SslConnector>,
    ) -> Self {
        TcpConnector {
            host,
            port,
            timeout,
            tls,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> Result<Box<dyn ReadWrite>, Error> {
        let mut last_error = None;
        for address in (self.host.as_str(), self.port).to_socket_addrs()? {
            let stream = match TcpStream::connect_timeout(&address, self.timeout)
            {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("Failed to connect to {}: {}", address, e);
                    last_error = Some(e);
                    continue;
                }
            };

            stream.set_read_timeout(Some(self.timeout))?;
            stream.set_write_timeout(Some(self.timeout))?;
            stream.set_nodelay(true)?;

            return match self.tls {
                None => Ok(Box::new(stream)),
                Some(ref connector) => {
                    let stream = connector.connect(&self.host, stream).map_err(
                        |e| match e {
                            HandshakeError::SetupFailure(es) => Error::Ssl(es),
                            HandshakeError::Failure(f) => {
                                Error::Ssl2(f.into_error())
                            }
                            HandshakeError::WouldBlock(f) => {
                                Error::Ssl2(f.into_error())
                            }
                        },
                    )?;
                    Ok(Box::new(stream))
                }
            };
        }

        Err(last_error
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} has no addresses", self.host),
                )
            })
            .into())
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct SyncClient {
    connector: Box<dyn Connector>,
    stream: Option<BufReader<Box<dyn ReadWrite>>>,
    cached_dirs: CachedDirs,
    log_prefix: LogPrefix,
}

impl SyncClient {
    pub fn new(connector: Box<dyn Connector>, log_prefix: LogPrefix) -> Self {
        log_prefix.set_address(connector.address());
        SyncClient {
            connector,
            stream: None,
            cached_dirs: CachedDirs::new(),
            log_prefix,
        }
    }

    /// Connect if not already connected and check the greeting.
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut stream = BufReader::new(self.connector.connect()?);
        let greeting = read_line(&mut stream)?;
        trace!("{} << {}", self.log_prefix, greeting);
        if !greeting.starts_with("READY") {
            return Err(Error::protocol(greeting));
        }

        debug!("{} Connected", self.log_prefix);
        self.stream = Some(stream);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("{} Disconnected", self.log_prefix);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The peer's directory tree as of the last `dir()`.
    pub fn cached_dirs(&self) -> &CachedDirs {
        &self.cached_dirs
    }

    /// Fetch the peer's directory tree, replacing `cached_dirs()`.
    pub fn dir(&mut self) -> Result<&CachedDirs, Error> {
        let result = self.dir_impl();
        if result.is_err() {
            self.cached_dirs.clear();
        }
        self.guard(result)?;
        Ok(&self.cached_dirs)
    }

    fn dir_impl(&mut self) -> Result<(), Error> {
        self.cached_dirs.clear();
        let mut line = self.begin(&Command::Dir)?;
        while let Response::Payload(payload) = Response::classify(&line) {
            let (last_modified, path) = parse_dir_line(payload)?;
            if self.cached_dirs.insert(&path, last_modified).is_none() {
                return Err(Error::protocol(line));
            }
            line = self.read_response_line()?;
        }

        expect_ready(&line)
    }

    /// List the files and file tombstones in `path` whose timestamp is at
    /// least `since`.
    pub fn list(
        &mut self,
        since: i64,
        path: &str,
    ) -> Result<Vec<RemoteFile>, Error> {
        let result = self.list_impl(since, path);
        self.guard(result)
    }

    fn list_impl(
        &mut self,
        since: i64,
        path: &str,
    ) -> Result<Vec<RemoteFile>, Error> {
        let mut files = Vec::new();
        let mut line = self.begin(&Command::List {
            since,
            path: path.to_owned(),
        })?;
        while let Response::Payload(payload) = Response::classify(&line) {
            files.push(parse_list_line(path, payload)?);
            line = self.read_response_line()?;
        }

        expect_ready(&line)?;
        Ok(files)
    }

    /// Fetch the content hash of every live file directly in `path`.
    pub fn hashes(
        &mut self,
        path: &str,
    ) -> Result<Vec<(String, ContentHash)>, Error> {
        let result = self.hashes_impl(path);
        self.guard(result)
    }

    fn hashes_impl(
        &mut self,
        path: &str,
    ) -> Result<Vec<(String, ContentHash)>, Error> {
        let mut hashes = Vec::new();
        let mut line = self.begin(&Command::Hash {
            path: path.to_owned(),
        })?;
        while let Response::Payload(payload) = Response::classify(&line) {
            hashes.push(parse_hash_line(payload)?);
            line = self.read_response_line()?;
        }

        expect_ready(&line)?;
        Ok(hashes)
    }

    /// Send `file`'s content, which is read from exactly `file.length()`
    /// bytes of `src`.
    pub fn upload(
        &mut self,
        file: &RemoteFile,
        src: &mut impl Read,
    ) -> Result<(), Error> {
        let result = self.upload_impl(file, src);
        self.guard(result)
    }

    fn upload_impl(
        &mut self,
        file: &RemoteFile,
        src: &mut impl Read,
    ) -> Result<(), Error> {
        if file.is_deleted() {
            return Err(Error::NotFound);
        }

        if file.length() < 0 {
            return Err(Error::NotFound);
        }

        let size = file.length() as u64;
        let line = self.begin(&Command::Put {
            last_modified: file.timestamp(),
            size,
            path: file.full_path(),
        })?;
        match Response::classify(&line) {
            Response::Receiving => (),
            Response::Error(msg) => return Err(Error::Remote(msg.to_owned())),
            _ => return Err(Error::protocol(line)),
        }

        trace!("{} >> [{} bytes]", self.log_prefix, size);
        let w = self.stream()?.get_mut();
        file_ops::copy_exact(src, w, size)?;
        w.flush()?;

        let line = self.read_response_line()?;
        expect_ready(&line)
    }

    /// Fetch the file at `path`, writing its content to `dst`.
    pub fn download(
        &mut self,
        path: &str,
        dst: &mut impl Write,
    ) -> Result<RemoteFile, Error> {
        let result = self.download_impl(path, dst);
        self.guard(result)
    }

    fn download_impl(
        &mut self,
        path: &str,
        dst: &mut impl Write,
    ) -> Result<RemoteFile, Error> {
        let line = self.begin(&Command::Get {
            path: path.to_owned(),
        })?;
        let file = match Response::classify(&line) {
            Response::File(rest) => parse_file_header(rest, path)?,
            Response::Error(msg) => return Err(Error::Remote(msg.to_owned())),
            _ => return Err(Error::protocol(line)),
        };

        trace!("{} << [{} bytes]", self.log_prefix, file.length());
        let stream = self.stream()?;
        let mut buf = [0u8; 8192];
        let mut remaining = file.length() as u64;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let nread = stream.read(&mut buf[..want])?;
            if 0 == nread {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed during download",
                )));
            }

            dst.write_all(&buf[..nread])?;
            remaining -= nread as u64;
        }

        let line = self.read_response_line()?;
        expect_ready(&line)?;
        Ok(file)
    }

    /// Rename `from` to `to` on the peer, giving it modification time
    /// `time`.
    pub fn move_file(
        &mut self,
        time: i64,
        from: &str,
        to: &str,
    ) -> Result<(), Error> {
        self.simple(Command::Move {
            time,
            from: from.to_owned(),
            to: to.to_owned(),
        })
    }

    /// Look up one file. A file tombstone is returned as a deleted
    /// `RemoteFile`; `None` means the peer knows nothing about `path`.
    pub fn exists(&mut self, path: &str) -> Result<Option<RemoteFile>, Error> {
        let result = self.exists_impl(path);
        self.guard(result)
    }

    fn exists_impl(&mut self, path: &str) -> Result<Option<RemoteFile>, Error> {
        let line = self.begin(&Command::Exists {
            path: path.to_owned(),
        })?;
        match Response::classify(&line) {
            Response::File(rest) => {
                let file = parse_file_header(rest, path)?;
                let line = self.read_response_line()?;
                expect_ready(&line)?;
                Ok(Some(file))
            }
            Response::Missing => Ok(None),
            Response::Error(msg) => Err(Error::Remote(msg.to_owned())),
            _ => Err(Error::protocol(line)),
        }
    }

    pub fn delete(&mut self, deleted: i64, path: &str) -> Result<(), Error> {
        self.simple(Command::Delete {
            deleted,
            path: path.to_owned(),
        })
    }

    pub fn mkdir(&mut self, last_modified: i64, path: &str) -> Result<(), Error> {
        self.simple(Command::Mkdir {
            last_modified,
            path: path.to_owned(),
        })
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), Error> {
        self.simple(Command::Rmdir {
            path: path.to_owned(),
        })
    }

    pub fn touch(&mut self, last_modified: i64, path: &str) -> Result<(), Error> {
        self.simple(Command::Touch {
            last_modified,
            path: path.to_owned(),
        })
    }

    /// Run a command whose only response is `READY` or `ERROR`.
    fn simple(&mut self, command: Command) -> Result<(), Error> {
        let result = self.begin(&command).and_then(|line| expect_ready(&line));
        self.guard(result)
    }

    /// Send `command` and return the first line of the response.
    ///
    /// An I/O or TLS error while connecting, writing, or reading that line
    /// causes a reconnect and exactly one retry.
    fn begin(&mut self, command: &Command) -> Result<String, Error> {
        match self.try_begin(command) {
            Err(e @ Error::Io(..))
            | Err(e @ Error::Ssl(..))
            | Err(e @ Error::Ssl2(..)) => {
                warn!(
                    "{} {} failed, reconnecting: {}",
                    self.log_prefix,
                    command.name(),
                    e
                );
                self.disconnect();
                self.try_begin(command)
            }
            result => result,
        }
    }

    fn try_begin(&mut self, command: &Command) -> Result<String, Error> {
        self.connect()?;
        let line = command.to_string();
        trace!("{} >> {}", self.log_prefix, line);
        write_line(self.stream()?.get_mut(), &line)?;
        self.read_response_line()
    }

    fn read_response_line(&mut self) -> Result<String, Error> {
        let line = read_line(self.stream()?)?;
        trace!("{} << {}", self.log_prefix, line);
        Ok(line)
    }

    fn stream(&mut self) -> Result<&mut BufReader<Box<dyn ReadWrite>>, Error> {
        self.stream.as_mut().ok_or_else(|| {
            Error::Io(io::Error::new(io::ErrorKind::NotConnected, "Not connected"))
        })
    }

    /// Drop the connection if `result` shows it can no longer be trusted.
    fn guard<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(ref e) = result {
            if e.is_connection_level() {
                warn!("{} Dropping connection: {}", self.log_prefix, e);
                self.disconnect();
            }
        }

        result
    }
}

fn expect_ready(line: &str) -> Result<(), Error> {
    match Response::classify(line) {
        Response::Ready => Ok(()),
        Response::Error(msg) => Err(Error::Remote(msg.to_owned())),
        _ => Err(Error::protocol(line)),
    }
}
