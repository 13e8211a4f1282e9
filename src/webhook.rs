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

//! Webhook ingestion.
//!
//! A delivery is authenticated before its body is parsed. Evaluation and the
//! resulting transition happen under the target payment's lock, and each
//! delivery id is applied at most once, so provider-side redelivery is safe.

use crate::PaymentError;
use crate::base::Provider;
use crate::orchestrator::Orchestrator;
use crate::payment::{Signal, SignalOutcome};
use crate::transaction::{Payload, RequestKind};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub struct WebhookReceiver {
    orchestrator: Arc<Orchestrator>,
}

impl WebhookReceiver {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Header the provider puts its credential in.
    pub fn signature_header(&self, provider: Provider) -> Result<&'static str, PaymentError> {
        Ok(self.orchestrator.adapters().get(provider)?.signature_header())
    }

    /// Processes one delivery.
    ///
    /// # Errors
    ///
    /// - [`PaymentError::WebhookAuthentication`] - credential check failed; nothing changes.
    /// - [`PaymentError::Validation`] - body could not be parsed.
    /// - [`PaymentError::ReferenceNotFound`] - no payment carries the reference.
    /// - [`PaymentError::NotAwaitingConfirmation`] - arrived before the gateway
    ///   acceptance was recorded; the provider should redeliver.
    pub fn receive(
        &self,
        provider: Provider,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<SignalOutcome, PaymentError> {
        let adapter = self.orchestrator.adapters().get(provider)?;
        if !adapter.authenticate(body, signature) {
            tracing::warn!(provider = %provider, "webhook failed authentication");
            return Err(PaymentError::WebhookAuthentication);
        }

        let notification = adapter.parse_notification(body)?;
        let payment = self
            .orchestrator
            .find_by_reference(provider, &notification.external_ref)
            .ok_or_else(|| {
                tracing::warn!(
                    provider = %provider,
                    reference = %notification.external_ref,
                    "webhook for unknown reference"
                );
                PaymentError::ReferenceNotFound(notification.external_ref.to_string())
            })?;

        let delivery_id = notification
            .delivery_id
            .clone()
            .unwrap_or_else(|| hex::encode(Sha256::digest(body)));
        tracing::info!(
            provider = %provider,
            payment_id = %payment.id(),
            delivery_id = %delivery_id,
            status = ?notification.status,
            "webhook received"
        );

        self.orchestrator.apply_signal(
            &payment,
            Signal {
                kind: RequestKind::Confirm,
                reported: notification.status.reported(),
                delivery_id: Some(delivery_id),
                reason: notification.reason,
                inbound: Some(Payload::new(body)),
                latency: None,
            },
        )
    }
}
