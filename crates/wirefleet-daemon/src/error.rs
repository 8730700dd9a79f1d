// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::fmt;

/// Coarse classification of a backend failure, used for operator
/// diagnostics and for deciding how loudly to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backend unreachable: DNS failure, refused connection or timeout.
    Connectivity,
    /// Missing or rejected SSH/API credentials.
    Authentication,
    /// Unexpected command output or API response.
    Protocol,
    /// No free address left in the subnet.
    ResourceExhausted,
    /// Peer or access key missing on one side.
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connectivity => "connectivity",
            Self::Authentication => "authentication",
            Self::Protocol => "protocol",
            Self::ResourceExhausted => "resource-exhausted",
            Self::NotFound => "not-found",
        })
    }
}
