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


use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe path name")]
    UnsafeName,
    #[error("No such file or directory")]
    NotFound,
    /// The peer sent something that does not fit the protocol. Carries the
    /// offending line.
    #[error("Protocol violation: {0}")]
    Protocol(String),
    /// The peer answered a command with `ERROR`.
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Ssl2(#[from] openssl::ssl::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether this error means the connection to the peer can no longer be
    /// trusted to be in a consistent state.
    ///
    /// Remote `ERROR` answers are per-command and leave the connection
    /// usable; everything else on the wire does not.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            *self,
            Error::Io(..) | Error::Protocol(..) | Error::Ssl(..) | Error::Ssl2(..)
        )
    }

    pub fn protocol(line: impl Into<String>) -> Self {
        Error::Protocol(line.into())
    }
}
