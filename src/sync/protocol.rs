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

//! The line-oriented synchronisation protocol.
//!
//! Every line is US-ASCII terminated by a bare `\n`. The client sends one
//! command per line; the server answers with zero or more payload lines (each
//! starting with a single space) followed by `READY`, or with a single
//! `ERROR <message>` line. `PUT` and `GET` additionally carry a raw byte
//! payload of a declared length.
//!
//! Timestamps on the wire are whole seconds since the epoch; everywhere else
//! they are milliseconds. Paths are single tokens: `%`, space, control
//! characters and non-ASCII bytes are written as `%XX`.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use super::cached_dir::CachedDir;
use super::remote_file::{split_full_path, RemoteFile};
use crate::store::tree::ContentHash;
use crate::support::error::Error;

/// The longest line either side will accept, including the line ending.
pub const MAX_LINE: usize = 4096;

pub const GREETING: &str = concat!("READY crymap-sync ", env!("CARGO_PKG_VERSION"));

/// A bidirectional byte stream, such as a TCP connection or a TLS session
/// over one.
pub trait ReadWrite: Read + Write + Send {}
impl<T: Read + Write + Send> ReadWrite for T {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// DIR
    Dir,
    /// LIST since path
    List { since: i64, path: String },
    /// PUT last-modified size path
    Put {
        last_modified: i64,
        size: u64,
        path: String,
    },
    /// GET path
    Get { path: String },
    /// MOVE new-time from to
    Move {
        time: i64,
        from: String,
        to: String,
    },
    /// EXISTS path
    Exists { path: String },
    /// DELETE deleted-time path
    Delete { deleted: i64, path: String },
    /// MKDIR last-modified path
    Mkdir { last_modified: i64, path: String },
    /// RMDIR path
    Rmdir { path: String },
    /// TOUCH last-modified path
    Touch { last_modified: i64, path: String },
    /// HASH path
    Hash { path: String },
}

impl Command {
    /// The command word, for logging.
    pub fn name(&self) -> &'static str {
        match *self {
            Command::Dir => "DIR",
            Command::List { .. } => "LIST",
            Command::Put { .. } => "PUT",
            Command::Get { .. } => "GET",
            Command::Move { .. } => "MOVE",
            Command::Exists { .. } => "EXISTS",
            Command::Delete { .. } => "DELETE",
            Command::Mkdir { .. } => "MKDIR",
            Command::Rmdir { .. } => "RMDIR",
            Command::Touch { .. } => "TOUCH",
            Command::Hash { .. } => "HASH",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Command::Dir => write!(f, "DIR"),
            Command::List { since, ref path } => {
                write!(f, "LIST {} {}", ms_to_wire(since), escape_path(path))
            }
            Command::Put {
                last_modified,
                size,
                ref path,
            } => write!(
                f,
                "PUT {} {} {}",
                ms_to_wire(last_modified),
                size,
                escape_path(path)
            ),
            Command::Get { ref path } => write!(f, "GET {}", escape_path(path)),
            Command::Move {
                time,
                ref from,
                ref to,
            } => write!(
                f,
                "MOVE {} {} {}",
                ms_to_wire(time),
                escape_path(from),
                escape_path(to)
            ),
            Command::Exists { ref path } => {
                write!(f, "EXISTS {}", escape_path(path))
            }
            Command::Delete { deleted, ref path } => write!(
                f,
                "DELETE {} {}",
                ms_to_wire(deleted),
                escape_path(path)
            ),
            Command::Mkdir {
                last_modified,
                ref path,
            } => write!(
                f,
                "MKDIR {} {}",
                ms_to_wire(last_modified),
                escape_path(path)
            ),
            Command::Rmdir { ref path } => {
                write!(f, "RMDIR {}", escape_path(path))
            }
            Command::Touch {
                last_modified,
                ref path,
            } => write!(
                f,
                "TOUCH {} {}",
                ms_to_wire(last_modified),
                escape_path(path)
            ),
            Command::Hash { ref path } => {
                write!(f, "HASH {}", escape_path(path))
            }
        }
    }
}

lazy_static! {
    static ref RX_LIST: Regex = Regex::new("^LIST (-?[0-9]+) ([^ ]+)$").unwrap();
    static ref RX_PUT: Regex =
        Regex::new("^PUT (-?[0-9]+) ([0-9]+) ([^ ]+)$").unwrap();
    static ref RX_GET: Regex = Regex::new("^GET ([^ ]+)$").unwrap();
    static ref RX_MOVE: Regex =
        Regex::new("^MOVE (-?[0-9]+) ([^ ]+) ([^ ]+)$").unwrap();
    static ref RX_EXISTS: Regex = Regex::new("^EXISTS ([^ ]+)$").unwrap();
    static ref RX_DELETE: Regex =
        Regex::new("^DELETE (-?[0-9]+) ([^ ]+)$").unwrap();
    static ref RX_MKDIR: Regex =
        Regex::new("^MKDIR (-?[0-9]+) ([^ ]+)$").unwrap();
    static ref RX_RMDIR: Regex = Regex::new("^RMDIR ([^ ]+)$").unwrap();
    static ref RX_TOUCH: Regex =
        Regex::new("^TOUCH (-?[0-9]+) ([^ ]+)$").unwrap();
    static ref RX_HASH: Regex = Regex::new("^HASH ([^ ]+)$").unwrap();
    static ref RX_KNOWN_COMMANDS: Regex = Regex::new(
        "^(DIR|LIST|PUT|GET|MOVE|EXISTS|DELETE|MKDIR|RMDIR|TOUCH|HASH)( .*)?$"
    )
    .unwrap();
}

pub fn looks_like_known_command(s: &str) -> bool {
    RX_KNOWN_COMMANDS.is_match(s)
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        fn time(cap: &regex::Captures<'_>, ix: usize) -> Result<i64, ()> {
            cap[ix].parse::<i64>().map(wire_to_ms).map_err(|_| ())
        }

        fn path(cap: &regex::Captures<'_>, ix: usize) -> Result<String, ()> {
            unescape_path(&cap[ix]).map_err(|_| ())
        }

        if "DIR" == s {
            Ok(Command::Dir)
        } else if let Some(cap) = RX_LIST.captures(s) {
            Ok(Command::List {
                since: time(&cap, 1)?,
                path: path(&cap, 2)?,
            })
        } else if let Some(cap) = RX_PUT.captures(s) {
            Ok(Command::Put {
                last_modified: time(&cap, 1)?,
                size: cap[2].parse::<u64>().map_err(|_| ())?,
                path: path(&cap, 3)?,
            })
        } else if let Some(cap) = RX_GET.captures(s) {
            Ok(Command::Get {
                path: path(&cap, 1)?,
            })
        } else if let Some(cap) = RX_MOVE.captures(s) {
            Ok(Command::Move {
                time: time(&cap, 1)?,
                from: path(&cap, 2)?,
                to: path(&cap, 3)?,
            })
        } else if let Some(cap) = RX_EXISTS.captures(s) {
            Ok(Command::Exists {
                path: path(&cap, 1)?,
            })
        } else if let Some(cap) = RX_DELETE.captures(s) {
            Ok(Command::Delete {
                deleted: time(&cap, 1)?,
                path: path(&cap, 2)?,
            })
        } else if let Some(cap) = RX_MKDIR.captures(s) {
            Ok(Command::Mkdir {
                last_modified: time(&cap, 1)?,
                path: path(&cap, 2)?,
            })
        } else if let Some(cap) = RX_RMDIR.captures(s) {
            Ok(Command::Rmdir {
                path: path(&cap, 1)?,
            })
        } else if let Some(cap) = RX_TOUCH.captures(s) {
            Ok(Command::Touch {
                last_modified: time(&cap, 1)?,
                path: path(&cap, 2)?,
            })
        } else if let Some(cap) = RX_HASH.captures(s) {
            Ok(Command::Hash {
                path: path(&cap, 1)?,
            })
        } else {
            Err(())
        }
    }
}

/// One line received from the server, without its line ending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Response<'a> {
    /// A payload line; the leading space has been removed.
    Payload(&'a str),
    /// `READY`, possibly followed by text (as in the greeting).
    Ready,
    /// `ERROR message`
    Error(&'a str),
    /// `FILE ...`, the rest of the line after the keyword.
    File(&'a str),
    /// `RECEIVING`
    Receiving,
    /// `MISSING path`
    Missing,
    /// Anything else.
    Other(&'a str),
}

impl<'a> Response<'a> {
    pub fn classify(line: &'a str) -> Self {
        if let Some(payload) = line.strip_prefix(' ') {
            Response::Payload(payload)
        } else if "READY" == line || line.starts_with("READY ") {
            Response::Ready
        } else if "ERROR" == line {
            Response::Error("")
        } else if let Some(msg) = line.strip_prefix("ERROR ") {
            Response::Error(msg)
        } else if let Some(rest) = line.strip_prefix("FILE ") {
            Response::File(rest)
        } else if "RECEIVING" == line {
            Response::Receiving
        } else if "MISSING" == line || line.starts_with("MISSING ") {
            Response::Missing
        } else {
            Response::Other(line)
        }
    }
}

pub fn ms_to_wire(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

pub fn wire_to_ms(seconds: i64) -> i64 {
    seconds.saturating_mul(1000)
}

fn parse_number(s: &str, line: &str) -> Result<i64, Error> {
    s.parse::<i64>().map_err(|_| Error::protocol(line))
}

/// Format the `DIR` payload line describing `dir`, including the leading
/// space.
pub fn format_dir_line(dir: &CachedDir) -> String {
    format!(
        " {} {}",
        ms_to_wire(dir.last_modified()),
        escape_path(dir.path())
    )
}

/// Parse a `DIR` payload line (without the leading space) into a timestamp
/// and path.
pub fn parse_dir_line(payload: &str) -> Result<(i64, String), Error> {
    let mut parts = payload.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(time), Some(path)) if !path.is_empty() => Ok((
            wire_to_ms(parse_number(time, payload)?),
            unescape_path(path)?,
        )),
        _ => Err(Error::protocol(payload)),
    }
}

/// Format the `LIST` payload line describing `file`, including the leading
/// space.
pub fn format_list_line(file: &RemoteFile) -> String {
    format!(
        " {} {} {} {}",
        if file.is_deleted() { "D" } else { "F" },
        ms_to_wire(file.timestamp()),
        file.length(),
        escape_path(file.name())
    )
}

/// Parse a `LIST` payload line (without the leading space) describing a file
/// in `dir`.
pub fn parse_list_line(dir: &str, payload: &str) -> Result<RemoteFile, Error> {
    let parts = payload.splitn(4, ' ').collect::<Vec<_>>();
    if 4 != parts.len() || parts[3].is_empty() {
        return Err(Error::protocol(payload));
    }

    Ok(RemoteFile::new(
        wire_to_ms(parse_number(parts[1], payload)?),
        parse_number(parts[2], payload)?,
        dir.to_owned(),
        unescape_path(parts[3])?,
    ))
}

/// Format the `FILE` line for `GET` (without path) or `EXISTS` (with path).
pub fn format_file_header(file: &RemoteFile, with_path: bool) -> String {
    if with_path {
        format!(
            "FILE {} {} {}",
            ms_to_wire(file.timestamp()),
            file.length(),
            escape_path(&file.full_path())
        )
    } else {
        format!("FILE {} {}", ms_to_wire(file.timestamp()), file.length())
    }
}

/// Parse the text following `FILE ` in a response about `requested_path`.
///
/// If the response includes a path, it is used; otherwise the file is
/// assumed to be `requested_path`.
pub fn parse_file_header(
    rest: &str,
    requested_path: &str,
) -> Result<RemoteFile, Error> {
    let parts = rest.splitn(3, ' ').collect::<Vec<_>>();
    if parts.len() < 2 {
        return Err(Error::protocol(format!("FILE {}", rest)));
    }

    let timestamp = wire_to_ms(parse_number(parts[0], rest)?);
    let length = parse_number(parts[1], rest)?;
    if length < 0 {
        return Err(Error::protocol(format!("FILE {}", rest)));
    }

    let path = match parts.get(2) {
        Some(p) if !p.is_empty() => Cow::Owned(unescape_path(p)?),
        _ => Cow::Borrowed(requested_path),
    };

    let (dir, name) = split_full_path(&path);
    Ok(RemoteFile::new(
        timestamp,
        length,
        dir.to_owned(),
        name.to_owned(),
    ))
}

/// Format the `HASH` payload line giving the content hash of the file
/// `name`, including the leading space.
pub fn format_hash_line(name: &str, hash: &ContentHash) -> String {
    let mut line = String::with_capacity(2 + 2 * hash.len() + name.len());
    line.push(' ');
    for b in hash {
        line.push_str(&format!("{:02x}", b));
    }
    line.push(' ');
    line.push_str(&escape_path(name));
    line
}

/// Parse a `HASH` payload line (without the leading space) into a file name
/// and content hash.
pub fn parse_hash_line(payload: &str) -> Result<(String, ContentHash), Error> {
    let mut parts = payload.splitn(2, ' ');
    let (hex, name) = match (parts.next(), parts.next()) {
        (Some(hex), Some(name)) if !name.is_empty() => (hex, name),
        _ => return Err(Error::protocol(payload)),
    };

    let mut hash = ContentHash::default();
    if hex.len() != 2 * hash.len() || !hex.is_ascii() {
        return Err(Error::protocol(payload));
    }
    for (ix, byte) in hash.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[2 * ix..2 * ix + 2], 16)
            .map_err(|_| Error::protocol(payload))?;
    }

    Ok((unescape_path(name)?, hash))
}

/// Escape `path` so that it is a single US-ASCII token.
pub fn escape_path(path: &str) -> Cow<'_, str> {
    fn needs_escape(b: u8) -> bool {
        b <= b' ' || b >= 0x7F || b == b'%'
    }

    if !path.bytes().any(needs_escape) {
        return Cow::Borrowed(path);
    }

    let mut out = String::with_capacity(path.len() + 8);
    for b in path.bytes() {
        if needs_escape(b) {
            out.push_str(&format!("%{:02X}", b));
        } else {
            out.push(b as char);
        }
    }
    Cow::Owned(out)
}

/// Reverse `escape_path`.
pub fn unescape_path(token: &str) -> Result<String, Error> {
    fn hex(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        if b'%' == bytes[ix] {
            let decoded = bytes
                .get(ix + 1)
                .copied()
                .and_then(hex)
                .zip(bytes.get(ix + 2).copied().and_then(hex))
                .map(|(hi, lo)| hi << 4 | lo)
                .ok_or_else(|| Error::protocol(token))?;
            out.push(decoded);
            ix += 3;
        } else {
            out.push(bytes[ix]);
            ix += 1;
        }
    }

    String::from_utf8(out).map_err(|_| Error::protocol(token))
}

/// Read one line of at most `MAX_LINE` bytes and strip its line ending.
///
/// Hitting the end of input is an `UnexpectedEof` I/O error. An over-long or
/// non-UTF-8 line is a protocol violation.
pub fn read_line(r: &mut impl BufRead) -> Result<String, Error> {
    let mut buf = Vec::new();
    r.by_ref()
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut buf)?;

    if buf.pop() != Some(b'\n') {
        return Err(if buf.len() + 1 >= MAX_LINE {
            Error::protocol("Line too long")
        } else {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Connection closed",
            ))
        });
    }

    String::from_utf8(buf).map_err(|e| {
        Error::protocol(String::from_utf8_lossy(e.as_bytes()).into_owned())
    })
}

/// Write `line` followed by a line ending and flush.
pub fn write_line(w: &mut impl Write, line: &str) -> io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    w.write_all(&buf)?;
    w.flush()
}
