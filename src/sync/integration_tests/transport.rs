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

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::defs::*;
use crate::sync::client::{Connector, SyncClient, TcpConnector};
use crate::sync::protocol::ReadWrite;
use crate::sync::remote_file::RemoteFile;
use crate::support::log_prefix::LogPrefix;

fn payload(len: usize) -> Vec<u8> {
    // Include line endings and things that look like responses so that any
    // framing mistake shows up.
    b"READY\nERROR x\r\n\0\xff"
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

#[test]
fn bytes_transfer_exactly_once() {
    let node = node("bytes");
    let mut client = node.client();

    for &len in &[0, 1, 8191, 8192, 8193, 100_000] {
        let path = format!("INBOX/cur/{}.x", len);
        let data = payload(len);
        let file = RemoteFile::from_full_path(1_600_000_000_000, len as i64, &path);
        client.upload(&file, &mut io::Cursor::new(&data)).unwrap();

        let mut downloaded = Vec::new();
        let fetched = client.download(&path, &mut downloaded).unwrap();
        assert_eq!(data, downloaded, "Length {}", len);
        assert_eq!(1_600_000_000_000, fetched.timestamp());
        assert_eq!(len as i64, fetched.length());
        assert_eq!(Some(data), node.read(&path));
    }

    // The connection is still in sync after all that
    assert!(client.exists("INBOX/cur/nx").unwrap().is_none());
}

#[test]
fn tls_transfer() {
    let node = tls_node("tls");
    let mut client = node.client();

    let data = payload(20_000);
    let file = RemoteFile::from_full_path(1_600_000_000_000, 20_000, "a/cur/x");
    client.upload(&file, &mut io::Cursor::new(&data)).unwrap();
    let mut downloaded = Vec::new();
    client.download("a/cur/x", &mut downloaded).unwrap();
    assert_eq!(data, downloaded);

    let dirs = client.dir().unwrap();
    assert!(dirs.get("a/cur").is_some());
}

/// Apply every mutating command once or twice, returning the resulting
/// files and directories.
fn apply_commands(
    times: usize,
) -> (
    std::collections::BTreeMap<String, Vec<u8>>,
    std::collections::BTreeSet<String>,
) {
    let node = node("replay");
    let mut client = node.client();
    let file = RemoteFile::from_full_path(1_600_000_000_000, 3, "A/cur/x");

    for _ in 0..times {
        client.mkdir(1_600_000_000_000, "A/cur").unwrap();
        client.mkdir(1_600_000_000_000, "B/cur").unwrap();
        client.mkdir(1_600_000_000_000, "Gone/cur").unwrap();
    }
    for _ in 0..times {
        client.upload(&file, &mut io::Cursor::new(b"abc")).unwrap();
    }
    for _ in 0..times {
        client
            .move_file(1_600_000_100_000, "A/cur/x", "B/cur/y")
            .unwrap();
    }
    for _ in 0..times {
        client.touch(1_500_000_000_000, "B/cur/y").unwrap();
        client.touch(1_500_000_000_000, "B/cur").unwrap();
    }
    for _ in 0..times {
        client.rmdir("Gone").unwrap();
    }

    client.upload(&file, &mut io::Cursor::new(b"abc")).unwrap();
    for _ in 0..times {
        client.delete(1_700_000_000_000, "A/cur/x").unwrap();
    }

    assert_eq!(1_500_000_000, node.mtime("B/cur/y"));
    assert_eq!(1_500_000_000, node.mtime("B/cur"));
    (node.contents(), node.dirs())
}

#[test]
fn replayed_commands_are_idempotent() {
    let once = apply_commands(1);
    let twice = apply_commands(2);
    assert_eq!(once, twice);

    let (files, dirs) = once;
    assert_eq!(
        vec!["B/cur/y"],
        files.keys().map(|k| k as &str).collect::<Vec<_>>()
    );
    assert!(dirs.contains("A/cur"));
    assert!(!dirs.contains("Gone"));
}

/// Wraps a real connector so that a test can sever the current connection
/// and count reconnections.
struct FlakyConnector {
    inner: TcpConnector,
    connects: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

struct FlakyStream {
    inner: Box<dyn ReadWrite>,
    severed: Arc<AtomicBool>,
}

impl FlakyStream {
    fn check(&self) -> io::Result<()> {
        if self.severed.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "Severed"))
        } else {
            Ok(())
        }
    }
}

impl Read for FlakyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.read(buf)
    }
}

impl Write for FlakyStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush()
    }
}

impl Connector for FlakyConnector {
    fn connect(&mut self) -> Result<Box<dyn ReadWrite>, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.connect()?;
        let severed = Arc::new(AtomicBool::new(false));
        *self.current.lock().unwrap() = Some(Arc::clone(&severed));
        Ok(Box::new(FlakyStream { inner, severed }))
    }

    fn address(&self) -> String {
        self.inner.address()
    }
}

#[test]
fn severed_connection_is_retried_transparently() {
    let node = node("flaky");
    let connects = Arc::new(AtomicUsize::new(0));
    let current = Arc::new(Mutex::new(None::<Arc<AtomicBool>>));
    let sever = || {
        current
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .store(true, Ordering::SeqCst)
    };

    let mut client = SyncClient::new(
        Box::new(FlakyConnector {
            inner: TcpConnector::new(
                "127.0.0.1".to_owned(),
                node.address.port(),
                std::time::Duration::from_secs(10),
                None,
            ),
            connects: Arc::clone(&connects),
            current: Arc::clone(&current),
        }),
        LogPrefix::new("sync-client".to_owned()),
    );

    client.mkdir(1_600_000_000_000, "INBOX/cur").unwrap();
    assert_eq!(1, connects.load(Ordering::SeqCst));

    sever();
    client.mkdir(1_600_000_000_000, "Other/cur").unwrap();
    assert_eq!(2, connects.load(Ordering::SeqCst));

    sever();
    let dirs = client.dir().unwrap();
    assert!(dirs.get("INBOX/cur").is_some());
    assert!(dirs.get("Other/cur").is_some());
    assert_eq!(3, connects.load(Ordering::SeqCst));

    // A whole pass over a connection that fails part way through still
    // converges on the next attempt.
    let local = super::defs::node("local");
    local.put("INBOX/cur/1.x", b"one", 1_600_000_000);
    sever();
    let report = run_pass(
        &local.store,
        &mut client,
        &node.peer(Direction::Both),
        SKEW_MS,
        &LogPrefix::new("local".to_owned()),
    )
    .unwrap();
    assert_eq!(1, report.pushed);
    assert_eq!(Some(b"one".to_vec()), node.read("INBOX/cur/1.x"));
}

/// Lets a fixed number of writes through, after which every connection,
/// current or future, fails.
struct CuttingConnector {
    inner: TcpConnector,
    writes_left: Arc<AtomicUsize>,
}

struct CuttingStream {
    inner: Box<dyn ReadWrite>,
    writes_left: Arc<AtomicUsize>,
}

fn cut() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "Cut")
}

impl Read for CuttingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if 0 == self.writes_left.load(Ordering::SeqCst) {
            return Err(cut());
        }
        self.inner.read(buf)
    }
}

impl Write for CuttingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if 0 == self.writes_left.load(Ordering::SeqCst) {
            return Err(cut());
        }
        self.writes_left.fetch_sub(1, Ordering::SeqCst);
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Connector for CuttingConnector {
    fn connect(&mut self) -> Result<Box<dyn ReadWrite>, Error> {
        if 0 == self.writes_left.load(Ordering::SeqCst) {
            return Err(Error::Io(cut()));
        }

        Ok(Box::new(CuttingStream {
            inner: self.inner.connect()?,
            writes_left: Arc::clone(&self.writes_left),
        }))
    }

    fn address(&self) -> String {
        self.inner.address()
    }
}

#[test]
fn aborted_pass_keeps_watermark_and_resumes() {
    let remote = node("remote");
    let local = node("local");
    let writes_left = Arc::new(AtomicUsize::new(usize::MAX));
    let mut client = SyncClient::new(
        Box::new(CuttingConnector {
            inner: TcpConnector::new(
                "127.0.0.1".to_owned(),
                remote.address.port(),
                std::time::Duration::from_secs(10),
                None,
            ),
            writes_left: Arc::clone(&writes_left),
        }),
        LogPrefix::new("sync-client".to_owned()),
    );
    let peer = remote.peer(Direction::Push);
    let log_prefix = LogPrefix::new("local".to_owned());

    local.put("INBOX/cur/0.x", b"zero", 1_600_000_000);
    run_pass(&local.store, &mut client, &peer, SKEW_MS, &log_prefix).unwrap();
    let watermark = local.store.watermark("remote");
    assert!(watermark.is_some());

    for i in 1..=5 {
        local.put(&format!("INBOX/cur/{}.x", i), b"more", 1_600_000_000);
    }

    // Enough for the directory listings and part of the uploads
    writes_left.store(4, Ordering::SeqCst);
    assert_matches!(
        Err(Error::Io(..)),
        run_pass(&local.store, &mut client, &peer, SKEW_MS, &log_prefix)
    );
    assert_eq!(watermark, local.store.watermark("remote"));
    assert!(remote.contents().len() < 6);

    writes_left.store(usize::MAX, Ordering::SeqCst);
    let report =
        run_pass(&local.store, &mut client, &peer, SKEW_MS, &log_prefix)
            .unwrap();
    assert_eq!(0, report.skipped);
    assert_eq!(6, remote.contents().len());
    assert_eq!(local.contents(), remote.contents());
    assert!(local.store.watermark("remote") >= watermark);
}
