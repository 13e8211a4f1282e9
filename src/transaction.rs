// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Payment transaction audit log.
//!
//! Every interaction with a provider, and every status transition, leaves one
//! [`PaymentTransaction`] behind. Entries are created through [`LogEntry`] and
//! stamped by the owning payment; once recorded they are never mutated.

use crate::PaymentError;
use crate::base::{PaymentId, Provider};
use crate::payment::TransactionStatus;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Kind of interaction an audit entry records.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    Initiate,
    Query,
    Confirm,
    Cancel,
    Refund,
    /// Confirmation window elapsed (written by the timeout sweep).
    Expire,
}

/// Opaque wire payload kept only for audit replay.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for Payload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Draft of an audit entry, completed by the payment that records it.
#[derive(Debug, Clone, Default)]
pub struct LogEntry {
    pub(crate) kind: Option<RequestKind>,
    pub(crate) outbound: Option<Payload>,
    pub(crate) inbound: Option<Payload>,
    pub(crate) latency: Option<Duration>,
    pub(crate) error_code: Option<String>,
    pub(crate) error_message: Option<String>,
}

impl LogEntry {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn outbound(mut self, payload: Payload) -> Self {
        self.outbound = Some(payload);
        self
    }

    pub fn inbound(mut self, payload: Option<Payload>) -> Self {
        self.inbound = payload;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    /// Attaches the code and message of `error`.
    pub fn failure(self, error: &PaymentError) -> Self {
        let code = match error {
            PaymentError::GatewayRejected { code, .. } => code.clone(),
            other => other.code().to_string(),
        };
        self.error(code, error.to_string())
    }
}

/// Immutable audit record of one interaction attempt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PaymentTransaction {
    /// Position in the owning payment's log, starting at 1.
    pub sequence: u32,
    pub payment_id: PaymentId,
    pub provider: Provider,
    pub kind: RequestKind,
    pub outbound: Option<Payload>,
    pub inbound: Option<Payload>,
    /// Payment status after this entry was recorded.
    pub status: TransactionStatus,
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub(crate) fn record(
        entry: LogEntry,
        sequence: u32,
        payment_id: PaymentId,
        provider: Provider,
        status: TransactionStatus,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let success = entry.error_code.is_none() && status != TransactionStatus::Failed;
        Self {
            sequence,
            payment_id,
            provider,
            kind: entry.kind.unwrap_or(RequestKind::Query),
            outbound: entry.outbound,
            inbound: entry.inbound,
            status,
            success,
            latency_ms: entry
                .latency
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            error_code: entry.error_code,
            error_message: entry.error_message,
            recorded_at,
        }
    }
}
