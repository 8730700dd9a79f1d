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

//! wirefleet-types: Shared data model for the wirefleet provisioning core.
//!
//! This crate contains the server, peer and telemetry types exchanged between
//! the backends, the fleet store and the reconciliation scheduler.

#![warn(missing_docs)]

pub mod peer;
pub mod server;
pub mod stats;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use peer::{CounterKind, DataLimit, Peer, PeerStatus, TransitionError, Usage};
pub use server::{AccessMethod, ServerAccess, SshAuth, VpnServer, WireGuardSettings};
pub use stats::{AccessArtifact, AccessKey, PeerStats, ServerStats};

/// A secret string (private key, password, admin key) that never shows up in
/// `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw secret. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}
