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

/// The name of the directory at the root of every synchronised tree which
/// holds the synchronisation state. It is never visible to peers.
pub const STATE_DIR_NAME: &str = ".crymap-sync";

/// Determine whether the given path segment is "safe".
///
/// This is used to validate each element of a path received from a peer
/// before it is used as a file system element. It excludes empty names and
/// patterns that cause directory traversal.
///
/// Unlike IMAP mailbox names, leading dots are allowed, since Maildir++
/// folders are conventionally named `.Sent` and so forth. Maildir file names
/// contain `:` and `,`, which are also fine.
pub fn is_safe_segment(name: &str) -> bool {
    !name.is_empty() &&
        name != "." &&
        name != ".." &&
        name.find('/').is_none() &&
        // Only a path separator on Windows, but always block since it has high
        // potential of causing problems
        name.find('\\').is_none() &&
        // Don't allow any ASCII control characters
        name.find(|c| c < ' ' || c == '\x7F').is_none()
}

/// Determine whether the given `/`-separated relative path is safe.
///
/// Every segment must pass `is_safe_segment`, and the first segment may not
/// refer to the synchronisation state directory.
pub fn is_safe_path(path: &str) -> bool {
    let mut segments = path.split('/');
    match segments.next() {
        None => false,
        Some(first) if first == STATE_DIR_NAME => false,
        Some(first) => is_safe_segment(first) && segments.all(is_safe_segment),
    }
}
