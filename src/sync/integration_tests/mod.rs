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

//! Integration tests for the synchronisation protocol and reconciliation.
//!
//! Every test runs real servers on loopback ports, each over its own store in
//! a temporary directory, and drives them with the real client and driver.
//! Nothing is mocked except, where a test needs it, the connection itself.

pub mod defs;

mod convergence;
mod policy;
mod transport;
