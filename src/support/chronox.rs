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

//! Helpers for the millisecond timestamps used throughout synchronisation.
//!
//! All in-memory timestamps are milliseconds since the UNIX epoch as `i64`.
//! Anything that has been or will be compared with a peer's value is
//! truncated to whole seconds, since that is all the wire carries.

use std::time::SystemTime;

use chrono::prelude::*;

/// The current time, in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The current time, truncated to whole seconds, in milliseconds.
pub fn now_seconds_ms() -> i64 {
    truncate_ms(now_ms())
}

pub fn system_time_ms(t: SystemTime) -> i64 {
    DateTime::<Utc>::from(t).timestamp_millis()
}

/// Truncate `ms` down to a whole second.
pub fn truncate_ms(ms: i64) -> i64 {
    ms - ms.rem_euclid(1000)
}

/// Format `ms` for humans, for use in log messages.
pub fn format_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => format!("@{}ms", ms),
    }
}
