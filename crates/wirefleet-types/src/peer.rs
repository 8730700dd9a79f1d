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

//! Peers (devices) provisioned on a server, their limits and lifecycle.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::Secret;

/// Byte cap used as a suspend: small enough that no real traffic fits.
pub const SUSPEND_CAP_BYTES: u64 = 1;

/// Requested data limit for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "bytes", rename_all = "snake_case")]
pub enum DataLimit {
    /// No cap.
    Unlimited,
    /// Near-zero cap that blocks transfer without deleting the peer.
    Suspended,
    /// Explicit byte cap.
    Capped(u64),
}

impl DataLimit {
    /// Interpret a caller-supplied byte count.
    ///
    /// `0` suspends, a positive value caps, anything else (negative or
    /// absent) removes the cap.
    pub fn from_request(bytes: Option<i64>) -> Self {
        match bytes {
            Some(0) => Self::Suspended,
            Some(b) if b > 0 => Self::Capped(b as u64),
            _ => Self::Unlimited,
        }
    }

    /// The byte cap to send to a backend, `None` for unlimited.
    pub fn cap_bytes(self) -> Option<u64> {
        match self {
            Self::Unlimited => None,
            Self::Suspended => Some(SUSPEND_CAP_BYTES),
            Self::Capped(bytes) => Some(bytes),
        }
    }
}

impl fmt::Display for DataLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Suspended => f.write_str("suspended"),
            Self::Capped(bytes) => write!(f, "{bytes} bytes"),
        }
    }
}

/// Lifecycle status of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    /// Provisioned and allowed to transfer.
    Active,
    /// Blocked after reaching its limit or by an admin.
    Suspended,
    /// Manually turned off.
    Disabled,
    /// Past its expiration timestamp. Terminal.
    Expired,
}

impl PeerStatus {
    /// Whether `self -> to` is an allowed lifecycle transition.
    pub fn can_transition(self, to: PeerStatus) -> bool {
        use PeerStatus::*;
        match (self, to) {
            (Expired, _) => false,
            (Active, Suspended) | (Suspended, Active) => true,
            (Active | Suspended | Disabled, Expired) => true,
            (Active | Suspended, Disabled) => true,
            (Disabled, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Disabled => "DISABLED",
            Self::Expired => "EXPIRED",
        })
    }
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot move peer from {from} to {to}")]
pub struct TransitionError {
    /// Status before the attempted change.
    pub from: PeerStatus,
    /// Requested status.
    pub to: PeerStatus,
}

/// Byte counters for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Bytes received from the peer.
    pub bytes_received: u64,
    /// Bytes sent to the peer.
    pub bytes_sent: u64,
}

impl Usage {
    /// Sent plus received.
    pub fn total(&self) -> u64 {
        self.bytes_received.saturating_add(self.bytes_sent)
    }

    /// Fold freshly observed backend counters into a cumulative total.
    ///
    /// `last` holds the counters seen on the previous sync. How a counter
    /// that went down is read depends on `kind`: a restarting counter was
    /// reset, so its whole new value is fresh transfer; a windowed counter
    /// just dropped older traffic, which adds nothing.
    pub fn absorb(&mut self, last: &mut Usage, observed: Usage, kind: CounterKind) {
        let delta = |now: u64, before: u64| match kind {
            _ if now >= before => now - before,
            CounterKind::Restarting => now,
            CounterKind::Windowed => 0,
        };
        self.bytes_received = self
            .bytes_received
            .saturating_add(delta(observed.bytes_received, last.bytes_received));
        self.bytes_sent = self
            .bytes_sent
            .saturating_add(delta(observed.bytes_sent, last.bytes_sent));
        *last = observed;
    }
}

/// How a backend's byte counters behave between syncs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Monotonic until the peer is re-added, then restarts from zero
    /// (WireGuard interface counters).
    #[default]
    Restarting,
    /// Transfer over a rolling window; the value can fall in normal
    /// operation (Outline transfer metrics).
    Windowed,
}

/// A device provisioned on one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique identifier.
    pub id: Uuid,
    /// Server this peer lives on.
    pub server_id: Uuid,
    /// Display name.
    pub name: String,
    /// Backend identity: WireGuard public key or Outline access-key id.
    pub backend_id: String,
    /// WireGuard private key, kept so the client config can be re-issued.
    #[serde(default)]
    pub private_key: Option<Secret>,
    /// Assigned VPN address (WireGuard only).
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
    /// Client access URL (Outline only).
    #[serde(default)]
    pub access_url: Option<String>,
    /// When set, no data limit is enforced.
    pub is_unlimited: bool,
    /// Per-device cap, overrides the plan cap.
    #[serde(default)]
    pub data_limit_bytes: Option<u64>,
    /// Cap inherited from the owner's plan.
    #[serde(default)]
    pub plan_limit_bytes: Option<u64>,
    /// Cumulative usage.
    #[serde(default)]
    pub usage: Usage,
    /// Raw backend counters seen on the last sync.
    #[serde(default)]
    pub last_counters: Usage,
    /// Last WireGuard handshake.
    #[serde(default)]
    pub last_handshake: Option<DateTime<Utc>>,
    /// Whether the peer was connected on the last sync.
    #[serde(default)]
    pub connected: bool,
    /// Lifecycle status.
    pub status: PeerStatus,
    /// Whether the peer is enabled.
    pub enabled: bool,
    /// Expiration timestamp, `None` for no expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Last backend error recorded against this peer.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Peer {
    /// A fresh, active, unlimited peer.
    pub fn new(server_id: Uuid, name: impl Into<String>, backend_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            server_id,
            name: name.into(),
            backend_id: backend_id.into(),
            private_key: None,
            address: None,
            access_url: None,
            is_unlimited: true,
            data_limit_bytes: None,
            plan_limit_bytes: None,
            usage: Usage::default(),
            last_counters: Usage::default(),
            last_handshake: None,
            connected: false,
            status: PeerStatus::Active,
            enabled: true,
            expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The limit to enforce: device override, else plan cap. `None` when
    /// the peer is unlimited.
    pub fn effective_limit(&self) -> Option<u64> {
        if self.is_unlimited {
            return None;
        }
        self.data_limit_bytes.or(self.plan_limit_bytes)
    }

    /// Whether cumulative usage has reached the effective limit.
    pub fn limit_reached(&self) -> bool {
        self.effective_limit()
            .is_some_and(|limit| self.usage.total() >= limit)
    }

    /// Whether the expiration timestamp has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Record a requested data limit on the peer.
    pub fn apply_limit(&mut self, limit: DataLimit) {
        match limit {
            DataLimit::Unlimited => {
                self.is_unlimited = true;
                self.data_limit_bytes = None;
            }
            DataLimit::Suspended => {
                self.is_unlimited = false;
                self.data_limit_bytes = Some(0);
            }
            DataLimit::Capped(bytes) => {
                self.is_unlimited = false;
                self.data_limit_bytes = Some(bytes);
            }
        }
        self.updated_at = Utc::now();
    }

    /// The limit currently recorded on the peer.
    pub fn recorded_limit(&self) -> DataLimit {
        match self.effective_limit() {
            None => DataLimit::Unlimited,
            Some(0) => DataLimit::Suspended,
            Some(bytes) => DataLimit::Capped(bytes),
        }
    }

    /// Move to `to`, keeping `enabled` in step with the status.
    pub fn transition(&mut self, to: PeerStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition(to) {
            return Err(TransitionError { from: self.status, to });
        }
        self.status = to;
        self.enabled = to == PeerStatus::Active;
        self.updated_at = Utc::now();
        Ok(())
    }
}
