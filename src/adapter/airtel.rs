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

//! Airtel Money merchant API.

use super::http::{self, Call, Exchange, scalar, with_status};
use super::{
    GatewayResponse, GatewayStatus, InitiateRequest, ProviderAdapter, ProviderPayload, RefundCall,
    WebhookNotification, parse_json, secure_eq, sign_base64,
};
use crate::PaymentError;
use crate::base::{ExternalRef, Provider};
use crate::config::AirtelMoneyConfig;
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AirtelCallbackTransaction {
    pub id: String,
    pub status_code: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub airtel_money_id: Option<String>,
}

/// Callback body Airtel posts on transaction completion.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AirtelCallback {
    pub transaction: AirtelCallbackTransaction,
}

/// Maps an Airtel transaction status code onto the generic vocabulary.
///
/// `TS` success, `TF` failed, `TE` expired; `TIP` and `TA` are in progress.
pub fn map_status(code: &str) -> GatewayStatus {
    match code.to_ascii_uppercase().as_str() {
        "TS" => GatewayStatus::Confirmed,
        "TF" | "TE" => GatewayStatus::Rejected,
        _ => GatewayStatus::Pending,
    }
}

/// `status.success == false` in a 200 reply is a business rejection.
fn envelope_rejection(exchange: &Exchange) -> Option<GatewayResponse> {
    let body = exchange.json();
    if body.pointer("/status/success").and_then(|v| v.as_bool()) != Some(false) {
        return None;
    }
    let code = body
        .pointer("/status/response_code")
        .or_else(|| body.pointer("/status/code"))
        .and_then(scalar)
        .unwrap_or_else(|| "REJECTED".into());
    let mut response = with_status(GatewayStatus::Rejected, Some(code));
    response.message = body.pointer("/status/message").and_then(scalar);
    Some(response)
}

#[derive(Debug)]
pub struct AirtelMoneyAdapter {
    config: AirtelMoneyConfig,
    client: Client,
}

impl AirtelMoneyAdapter {
    pub fn new(config: AirtelMoneyConfig, timeout: Duration) -> Result<Self, PaymentError> {
        Ok(Self {
            config,
            client: http::client(timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn access_token(&self) -> Result<String, PaymentError> {
        let response = self
            .client
            .post(self.url("/auth/oauth2/token"))
            .json(&TokenRequest {
                client_id: &self.config.client_id,
                client_secret: &self.config.client_secret,
                grant_type: "client_credentials",
            })
            .send()
            .map_err(|e| PaymentError::GatewayUnavailable(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::GatewayUnavailable(format!("token endpoint HTTP {status}")));
        }
        if !status.is_success() {
            return Err(PaymentError::GatewayRejected {
                code: "AUTHENTICATION_FAILED".into(),
                message: format!("token endpoint HTTP {status}"),
            });
        }
        response
            .json::<TokenResponse>()
            .map(|t| t.access_token)
            .map_err(|e| PaymentError::GatewayUnavailable(format!("token response: {e}")))
    }

    fn authorized(&self, request: RequestBuilder, token: &str, currency: &str) -> RequestBuilder {
        request
            .bearer_auth(token)
            .header("X-Country", &self.config.country)
            .header("X-Currency", currency)
    }
}

impl ProviderAdapter for AirtelMoneyAdapter {
    fn provider(&self) -> Provider {
        Provider::AirtelMoney
    }

    fn initiate(&self, request: &InitiateRequest) -> GatewayResponse {
        let body = json!({
            "reference": request.payable.to_string(),
            "subscriber": {
                "country": self.config.country,
                "currency": request.currency.as_str(),
                "msisdn": request.payer,
            },
            "transaction": {
                "amount": request.amount.to_string(),
                "country": self.config.country,
                "currency": request.currency.as_str(),
                "id": request.reference.as_str(),
            },
        });
        let call = Call::start(http::payload_of(&body));
        let token = match self.access_token() {
            Ok(token) => token,
            Err(e) => return call.abort(&e),
        };

        let builder = self
            .authorized(
                self.client.post(self.url("/merchant/v1/payments/")),
                &token,
                request.currency.as_str(),
            )
            .json(&body);
        let reference = request.reference.clone();
        call.send(builder, move |exchange| {
            envelope_rejection(exchange)
                .unwrap_or_else(|| with_status(GatewayStatus::Accepted, None))
                .external_ref(reference)
        })
    }

    fn query(&self, external_ref: &ExternalRef) -> GatewayResponse {
        let path = format!("/standard/v1/payments/{external_ref}");
        let call = Call::start(path.as_str().into());
        let token = match self.access_token() {
            Ok(token) => token,
            Err(e) => return call.abort(&e),
        };

        let builder = self.authorized(self.client.get(self.url(&path)), &token, &self.config.currency);
        let reference = external_ref.clone();
        call.send(builder, move |exchange| {
            let body = exchange.json();
            let code = body
                .pointer("/data/transaction/status")
                .or_else(|| body.pointer("/status/status"))
                .and_then(scalar)
                .unwrap_or_default();
            let mut response = with_status(map_status(&code), Some(code)).external_ref(reference);
            response.message = body.pointer("/data/transaction/message").and_then(scalar);
            response
        })
    }

    fn refund(&self, request: &RefundCall) -> GatewayResponse {
        let body = json!({
            "transaction": { "airtel_money_id": request.payment_ref.as_str() },
        });
        let call = Call::start(http::payload_of(&body));
        let token = match self.access_token() {
            Ok(token) => token,
            Err(e) => return call.abort(&e),
        };

        let builder = self
            .authorized(
                self.client.post(self.url("/standard/v1/payments/refund")),
                &token,
                request.currency.as_str(),
            )
            .json(&body);
        let fallback = request.refund_reference.clone();
        call.send(builder, move |exchange| {
            if let Some(rejected) = envelope_rejection(exchange) {
                return rejected;
            }
            let reference = exchange
                .json()
                .pointer("/data/transaction/airtel_money_id")
                .and_then(scalar)
                .map(ExternalRef::new)
                .unwrap_or(fallback);
            with_status(GatewayStatus::Accepted, None).external_ref(reference)
        })
    }

    fn signature_header(&self) -> &'static str {
        "X-Signature"
    }

    fn authenticate(&self, body: &[u8], signature: Option<&str>) -> bool {
        match (signature, sign_base64(&self.config.webhook_secret, body)) {
            (Some(provided), Some(expected)) => secure_eq(&expected, provided.trim()),
            _ => false,
        }
    }

    fn parse_notification(&self, body: &[u8]) -> Result<WebhookNotification, PaymentError> {
        let callback: AirtelCallback = parse_json(Provider::AirtelMoney, body)?;
        let transaction = &callback.transaction;
        let status = map_status(&transaction.status_code);
        Ok(WebhookNotification {
            external_ref: ExternalRef::new(transaction.id.clone()),
            status,
            delivery_id: transaction.airtel_money_id.clone(),
            reason: match status {
                GatewayStatus::Rejected => transaction.message.clone(),
                _ => None,
            },
            payload: ProviderPayload::AirtelMoney(callback),
        })
    }
}
