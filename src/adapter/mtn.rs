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

//! MTN Mobile Money collection API.

use super::http::{self, Call, scalar, with_status};
use super::{
    GatewayResponse, GatewayStatus, InitiateRequest, ProviderAdapter, ProviderPayload, RefundCall,
    WebhookNotification, parse_json, secure_eq, sign_hex,
};
use crate::PaymentError;
use crate::base::{ExternalRef, Provider};
use crate::config::MtnMomoConfig;
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const SUBSCRIPTION_HEADER: &str = "Ocp-Apim-Subscription-Key";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Party<'a> {
    party_id_type: &'static str,
    party_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestToPay<'a> {
    amount: String,
    currency: &'a str,
    external_id: &'a str,
    payer: Party<'a>,
    payer_message: String,
    payee_note: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefundToPay<'a> {
    amount: String,
    currency: &'a str,
    external_id: &'a str,
    payer_message: &'a str,
    payee_note: &'a str,
    reference_id_to_refund: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Callback body MTN posts to the merchant callback URL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtnCallback {
    /// The `X-Reference-Id` of the request-to-pay.
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub financial_transaction_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub reason: Option<Value>,
}

/// Maps an MTN request-to-pay status onto the generic vocabulary.
pub fn map_status(status: &str) -> GatewayStatus {
    match status.to_ascii_uppercase().as_str() {
        "SUCCESSFUL" => GatewayStatus::Confirmed,
        "FAILED" | "REJECTED" | "TIMEOUT" => GatewayStatus::Rejected,
        _ => GatewayStatus::Pending,
    }
}

fn reason_text(reason: Option<&Value>) -> Option<String> {
    let reason = reason?;
    scalar(reason).or_else(|| reason.get("code").and_then(scalar))
}

#[derive(Debug)]
pub struct MtnMomoAdapter {
    config: MtnMomoConfig,
    client: Client,
}

impl MtnMomoAdapter {
    pub fn new(config: MtnMomoConfig, timeout: Duration) -> Result<Self, PaymentError> {
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
            .post(self.url("/collection/token/"))
            .basic_auth(&self.config.api_user, Some(&self.config.api_key))
            .header(SUBSCRIPTION_HEADER, &self.config.subscription_key)
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

    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .bearer_auth(token)
            .header("X-Target-Environment", &self.config.target_environment)
            .header(SUBSCRIPTION_HEADER, &self.config.subscription_key)
    }
}

impl ProviderAdapter for MtnMomoAdapter {
    fn provider(&self) -> Provider {
        Provider::MtnMomo
    }

    fn initiate(&self, request: &InitiateRequest) -> GatewayResponse {
        let label = request.payable.to_string();
        let body = RequestToPay {
            amount: request.amount.to_string(),
            currency: request.currency.as_str(),
            external_id: request.reference.as_str(),
            payer: Party {
                party_id_type: "MSISDN",
                party_id: &request.payer,
            },
            payer_message: format!("Payment for {label}"),
            payee_note: label,
        };
        let call = Call::start(http::payload_of(&body));
        let token = match self.access_token() {
            Ok(token) => token,
            Err(e) => return call.abort(&e),
        };

        let builder = self
            .authorized(self.client.post(self.url("/collection/v1_0/requesttopay")), &token)
            .header("X-Reference-Id", request.reference.as_str())
            .json(&body);
        let reference = request.reference.clone();
        call.send(builder, move |_| {
            with_status(GatewayStatus::Accepted, None).external_ref(reference)
        })
    }

    fn query(&self, external_ref: &ExternalRef) -> GatewayResponse {
        let path = format!("/collection/v1_0/requesttopay/{external_ref}");
        let call = Call::start(path.as_str().into());
        let token = match self.access_token() {
            Ok(token) => token,
            Err(e) => return call.abort(&e),
        };

        let builder = self.authorized(self.client.get(self.url(&path)), &token);
        let reference = external_ref.clone();
        call.send(builder, move |exchange| {
            let body = exchange.json();
            let status = body.get("status").and_then(scalar).unwrap_or_default();
            let mut response = with_status(map_status(&status), Some(status)).external_ref(reference);
            response.message = reason_text(body.get("reason"));
            response
        })
    }

    fn refund(&self, request: &RefundCall) -> GatewayResponse {
        let body = RefundToPay {
            amount: request.amount.to_string(),
            currency: request.currency.as_str(),
            external_id: request.refund_reference.as_str(),
            payer_message: &request.reason,
            payee_note: &request.reason,
            reference_id_to_refund: request.payment_ref.as_str(),
        };
        let call = Call::start(http::payload_of(&body));
        let token = match self.access_token() {
            Ok(token) => token,
            Err(e) => return call.abort(&e),
        };

        let builder = self
            .authorized(self.client.post(self.url("/collection/v2_0/refund")), &token)
            .header("X-Reference-Id", request.refund_reference.as_str())
            .json(&body);
        let reference = request.refund_reference.clone();
        call.send(builder, move |_| {
            with_status(GatewayStatus::Accepted, None).external_ref(reference)
        })
    }

    fn signature_header(&self) -> &'static str {
        "X-Callback-Signature"
    }

    fn authenticate(&self, body: &[u8], signature: Option<&str>) -> bool {
        match (signature, sign_hex(&self.config.webhook_secret, body)) {
            (Some(provided), Some(expected)) => {
                secure_eq(&expected, &provided.trim().to_ascii_lowercase())
            }
            _ => false,
        }
    }

    fn parse_notification(&self, body: &[u8]) -> Result<WebhookNotification, PaymentError> {
        let callback: MtnCallback = parse_json(Provider::MtnMomo, body)?;
        let reference = callback
            .reference_id
            .clone()
            .or_else(|| callback.external_id.clone())
            .ok_or_else(|| PaymentError::Validation("MTN callback without reference".into()))?;
        Ok(WebhookNotification {
            external_ref: ExternalRef::new(reference),
            status: map_status(&callback.status),
            delivery_id: callback.financial_transaction_id.clone(),
            reason: reason_text(callback.reason.as_ref()),
            payload: ProviderPayload::MtnMomo(callback),
        })
    }
}
