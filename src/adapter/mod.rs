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

//! Provider adapters.
//!
//! Each gateway is one stateless [`ProviderAdapter`] implementation that maps
//! its wire format onto the generic [`GatewayStatus`] vocabulary. Adapters are
//! selected by configuration through the [`AdapterRegistry`].
//!
//! Adapter calls block for at most the configured gateway timeout and never
//! touch payment state; the orchestrator records what they return.

pub mod airtel;
pub mod bank;
mod http;
pub mod mtn;

use crate::PaymentError;
use crate::base::{Currency, ExternalRef, Payable, PaymentMethod, Provider};
use crate::config::Config;
use crate::payment::TransactionStatus;
use crate::transaction::{LogEntry, Payload, RequestKind};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;

pub use airtel::AirtelMoneyAdapter;
pub use bank::BankTransferAdapter;
pub use mtn::MtnMomoAdapter;

type HmacSha256 = Hmac<Sha256>;

/// Generic outcome vocabulary shared by all providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    Accepted,
    Pending,
    Confirmed,
    Rejected,
    Unavailable,
}

impl GatewayStatus {
    /// Terminal payment status a report of this kind implies, if any.
    pub fn reported(&self) -> Option<TransactionStatus> {
        match self {
            Self::Confirmed => Some(TransactionStatus::Confirmed),
            Self::Rejected => Some(TransactionStatus::Failed),
            Self::Accepted | Self::Pending | Self::Unavailable => None,
        }
    }
}

/// Request to collect funds from a payer.
#[derive(Debug, Clone, Serialize)]
pub struct InitiateRequest {
    /// Reference generated for this attempt; providers echo it back.
    pub reference: ExternalRef,
    pub amount: Decimal,
    pub currency: Currency,
    pub method: PaymentMethod,
    pub payer: String,
    pub payable: Payable,
}

/// Request to return funds for a settled payment.
#[derive(Debug, Clone, Serialize)]
pub struct RefundCall {
    pub payment_ref: ExternalRef,
    /// Reference generated for the refund itself.
    pub refund_reference: ExternalRef,
    pub amount: Decimal,
    pub currency: Currency,
    pub reason: String,
}

/// Uniform result of one adapter call.
///
/// Failures are carried as [`GatewayStatus::Rejected`] or
/// [`GatewayStatus::Unavailable`] rather than as `Err`, so the wire payloads
/// of a failed exchange still reach the audit log.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: GatewayStatus,
    pub external_ref: Option<ExternalRef>,
    /// Provider status or error code.
    pub provider_code: Option<String>,
    pub message: Option<String>,
    pub outbound: Payload,
    pub inbound: Option<Payload>,
    pub latency: Duration,
}

impl GatewayResponse {
    pub fn new(status: GatewayStatus, outbound: Payload) -> Self {
        Self {
            status,
            external_ref: None,
            provider_code: None,
            message: None,
            outbound,
            inbound: None,
            latency: Duration::ZERO,
        }
    }

    /// Response for a call that failed before or during the exchange.
    pub fn from_error(error: &PaymentError, outbound: Payload) -> Self {
        let mut response = match error {
            PaymentError::GatewayRejected { code, message } => {
                let mut r = Self::new(GatewayStatus::Rejected, outbound);
                r.provider_code = Some(code.clone());
                r.message = Some(message.clone());
                r
            }
            other => {
                let mut r = Self::new(GatewayStatus::Unavailable, outbound);
                r.message = Some(other.to_string());
                r
            }
        };
        response.provider_code.get_or_insert_with(|| error.code().to_string());
        response
    }

    pub fn external_ref(mut self, reference: ExternalRef) -> Self {
        self.external_ref = Some(reference);
        self
    }

    pub fn provider_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    /// The error this response represents, if it is a failure.
    pub fn error(&self) -> Option<PaymentError> {
        match self.status {
            GatewayStatus::Rejected => Some(PaymentError::GatewayRejected {
                code: self
                    .provider_code
                    .clone()
                    .unwrap_or_else(|| "REJECTED".to_string()),
                message: self.message.clone().unwrap_or_default(),
            }),
            GatewayStatus::Unavailable => Some(PaymentError::GatewayUnavailable(
                self.message
                    .clone()
                    .unwrap_or_else(|| "gateway unavailable".to_string()),
            )),
            _ => None,
        }
    }

    /// Audit entry describing this exchange.
    pub fn log_entry(&self, kind: RequestKind) -> LogEntry {
        let entry = LogEntry::new(kind)
            .outbound(self.outbound.clone())
            .inbound(self.inbound.clone())
            .latency(self.latency);
        match self.error() {
            Some(error) => entry.failure(&error),
            None => entry,
        }
    }
}

/// Fields the engine inspects from each provider's callback body.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderPayload {
    MtnMomo(mtn::MtnCallback),
    AirtelMoney(airtel::AirtelCallback),
    BankTransfer(bank::FlutterwaveEvent),
}

/// Parsed, provider-independent webhook content.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookNotification {
    pub external_ref: ExternalRef,
    pub status: GatewayStatus,
    /// Provider-side identifier of this delivery, when the provider sends one.
    pub delivery_id: Option<String>,
    pub reason: Option<String>,
    pub payload: ProviderPayload,
}

/// One gateway integration.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Asks the provider to collect funds.
    fn initiate(&self, request: &InitiateRequest) -> GatewayResponse;

    /// Current provider-side status of a collection.
    fn query(&self, external_ref: &ExternalRef) -> GatewayResponse;

    /// Returns funds; `external_ref` of the response is the refund reference.
    fn refund(&self, request: &RefundCall) -> GatewayResponse;

    /// Header carrying the webhook credential.
    fn signature_header(&self) -> &'static str;

    /// Validates a webhook body against its credential header.
    fn authenticate(&self, body: &[u8], signature: Option<&str>) -> bool;

    /// Parses an authenticated webhook body.
    fn parse_notification(&self, body: &[u8]) -> Result<WebhookNotification, PaymentError>;
}

/// Configuration-selected set of adapters, one per provider.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the wire adapters for every provider with credentials in `config`.
    pub fn from_config(config: &Config) -> Result<Self, PaymentError> {
        let mut registry = Self::new();
        if let Some(mtn) = &config.mtn {
            registry = registry.with(Arc::new(MtnMomoAdapter::new(
                mtn.clone(),
                config.gateway_timeout,
            )?));
        }
        if let Some(airtel) = &config.airtel {
            registry = registry.with(Arc::new(AirtelMoneyAdapter::new(
                airtel.clone(),
                config.gateway_timeout,
            )?));
        }
        if let Some(bank) = &config.bank {
            registry = registry.with(Arc::new(BankTransferAdapter::new(
                bank.clone(),
                config.gateway_timeout,
            )?));
        }
        Ok(registry)
    }

    /// Registers `adapter`, replacing any adapter for the same provider.
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>, PaymentError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| PaymentError::UnknownProvider(provider.to_string()))
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.adapters.contains_key(&provider)
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.adapters.keys().copied().collect();
        providers.sort();
        providers
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

/// HMAC-SHA256 of `body` under `secret`, hex encoded.
pub fn sign_hex(secret: &str, body: &[u8]) -> Option<String> {
    hmac_sha256(secret, body).map(hex::encode)
}

/// HMAC-SHA256 of `body` under `secret`, base64 encoded.
pub fn sign_base64(secret: &str, body: &[u8]) -> Option<String> {
    hmac_sha256(secret, body).map(|mac| BASE64.encode(mac))
}

fn hmac_sha256(secret: &str, body: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Constant-time equality; length is not secret.
pub(crate) fn secure_eq(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    expected.len() == provided.len() && bool::from(expected.ct_eq(provided))
}

/// Parses a webhook body as JSON, mapping failures to a validation error.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    provider: Provider,
    body: &[u8],
) -> Result<T, PaymentError> {
    serde_json::from_slice(body)
        .map_err(|e| PaymentError::Validation(format!("malformed {provider} webhook: {e}")))
}
