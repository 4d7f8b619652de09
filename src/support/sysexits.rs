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

//! Constants from `sysexits.h`, the subset the CLI actually exits with.

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_NOHOST: Sysexit = Sysexit(68);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_PROTOCOL: Sysexit = Sysexit(76);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// Choose the exit code for a failed synchronisation command.
    ///
    /// Anything the next scheduled pass could plausibly fix is `EX_TEMPFAIL`
    /// so that wrappers like cron mail only on real problems.
    pub fn for_error(error: &Error) -> Self {
        match *error {
            Error::Io(..) | Error::Remote(..) => EX_TEMPFAIL,
            Error::Protocol(..) => EX_PROTOCOL,
            Error::Ssl(..) | Error::Ssl2(..) => EX_UNAVAILABLE,
            Error::Config(..) => EX_CONFIG,
            Error::UnsafeName | Error::NotFound => EX_USAGE,
            Error::Cbor(..) | Error::Nix(..) => EX_IOERR,
        }
    }
}
