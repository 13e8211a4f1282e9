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

//! Blocking HTTP exchange shared by the wire adapters.

use super::{GatewayResponse, GatewayStatus};
use crate::PaymentError;
use crate::transaction::Payload;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

pub(crate) fn client(timeout: Duration) -> Result<Client, PaymentError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PaymentError::Config(format!("http client: {e}")))
}

pub(crate) fn payload_of<T: Serialize>(body: &T) -> Payload {
    Payload::new(serde_json::to_vec(body).unwrap_or_default())
}

/// A raw 2xx exchange.
pub(crate) struct Exchange {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl Exchange {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

/// One timed provider call.
pub(crate) struct Call {
    outbound: Payload,
    started: Instant,
}

impl Call {
    pub fn start(outbound: Payload) -> Self {
        Self {
            outbound,
            started: Instant::now(),
        }
    }

    /// Response for a failure before the main request was sent (e.g. token fetch).
    pub fn abort(self, error: &PaymentError) -> GatewayResponse {
        let mut response = GatewayResponse::from_error(error, self.outbound);
        response.latency = self.started.elapsed();
        response
    }

    /// Sends `request` and classifies the reply.
    ///
    /// Network errors and 5xx become `Unavailable`, other non-2xx become
    /// `Rejected`; 2xx replies are handed to `interpret`.
    pub fn send(
        self,
        request: RequestBuilder,
        interpret: impl FnOnce(&Exchange) -> GatewayResponse,
    ) -> GatewayResponse {
        let result = request.send().and_then(|r| {
            let status = r.status();
            r.bytes().map(|b| Exchange {
                status,
                body: b.to_vec(),
            })
        });
        let latency = self.started.elapsed();

        let mut response = match result {
            Err(e) => {
                tracing::warn!(error = %e, "gateway request failed");
                GatewayResponse::from_error(&PaymentError::GatewayUnavailable(e.to_string()), self.outbound)
            }
            Ok(exchange) => {
                let inbound = Payload::new(exchange.body.clone());
                let mut response = if exchange.status.is_server_error() {
                    GatewayResponse::from_error(
                        &PaymentError::GatewayUnavailable(format!("HTTP {}", exchange.status)),
                        self.outbound,
                    )
                } else if !exchange.status.is_success() {
                    GatewayResponse::from_error(&rejection(&exchange), self.outbound)
                } else {
                    let mut r = interpret(&exchange);
                    r.outbound = self.outbound;
                    r
                };
                response.inbound = Some(inbound);
                response
            }
        };
        response.latency = latency;
        response
    }
}

/// Rejection carrying the provider's error code when the body has one.
fn rejection(exchange: &Exchange) -> PaymentError {
    let body = exchange.json();
    let code = ["code", "error_code", "status_code"]
        .iter()
        .find_map(|k| body.get(*k).and_then(scalar))
        .or_else(|| body.pointer("/status/code").and_then(scalar))
        .unwrap_or_else(|| format!("HTTP_{}", exchange.status.as_u16()));
    let message = ["message", "error", "reason"]
        .iter()
        .find_map(|k| body.get(*k).and_then(scalar))
        .or_else(|| body.pointer("/status/message").and_then(scalar))
        .unwrap_or_else(|| exchange.status.to_string());
    PaymentError::GatewayRejected { code, message }
}

pub(crate) fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Response for a 2xx reply that carries an explicit provider status.
pub(crate) fn with_status(status: GatewayStatus, code: Option<String>) -> GatewayResponse {
    let mut response = GatewayResponse::new(status, Payload::default());
    response.provider_code = code;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(status: u16, body: &str) -> Exchange {
        Exchange {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn rejection_reads_provider_code() {
        let error = rejection(&exchange(400, r#"{"code":"PAYER_NOT_FOUND","message":"unknown msisdn"}"#));
        assert_eq!(
            error,
            PaymentError::GatewayRejected {
                code: "PAYER_NOT_FOUND".into(),
                message: "unknown msisdn".into()
            }
        );
    }

    #[test]
    fn rejection_reads_nested_status() {
        let error = rejection(&exchange(
            409,
            r#"{"status":{"code":"DP00800001006","message":"duplicate"}}"#,
        ));
        assert!(matches!(error, PaymentError::GatewayRejected { code, .. } if code == "DP00800001006"));
    }

    #[test]
    fn rejection_falls_back_to_http_status() {
        let error = rejection(&exchange(404, ""));
        assert!(matches!(error, PaymentError::GatewayRejected { code, .. } if code == "HTTP_404"));
    }
}
