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

//! Error types for payment settlement.

use crate::base::{PaymentId, RefundId};
use crate::payment::TransactionStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Payment settlement errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    /// Malformed request; never reaches a gateway
    #[error("validation failed: {0}")]
    Validation(String),

    /// Network failure or 5xx-class gateway response
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Explicit business rejection from the gateway
    #[error("gateway rejected request ({code}): {message}")]
    GatewayRejected { code: String, message: String },

    /// No confirmation arrived within the confirmation window
    #[error("no confirmation within the confirmation window")]
    GatewayTimeout,

    /// Statement amount disagrees with the recorded payment
    #[error("statement line {reference} shows {actual}, payment recorded {expected}")]
    ReconciliationDiscrepancy {
        reference: String,
        expected: Decimal,
        actual: Decimal,
    },

    /// Refund would push completed refunds above the confirmed amount
    #[error(
        "refund of {requested} exceeds remaining balance ({already_refunded} of {confirmed} already refunded)"
    )]
    RefundAmountExceeded {
        requested: Decimal,
        already_refunded: Decimal,
        confirmed: Decimal,
    },

    /// Referenced payment does not exist
    #[error("payment {0} not found")]
    PaymentNotFound(PaymentId),

    /// No payment carries the given provider reference
    #[error("no payment for reference {0}")]
    ReferenceNotFound(String),

    /// Referenced refund request does not exist
    #[error("refund {0} not found")]
    RefundNotFound(RefundId),

    /// Provider name not recognised or not configured
    #[error("unknown or unconfigured provider: {0}")]
    UnknownProvider(String),

    /// Requested status change is not an edge of the state graph
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Payment reached CONFIRMED, FAILED or TIMEOUT
    #[error("payment is in terminal state {0:?}")]
    PaymentTerminal(TransactionStatus),

    /// Confirmation arrived before the gateway accepted the request
    #[error("payment is not awaiting confirmation (status {0:?})")]
    NotAwaitingConfirmation(TransactionStatus),

    /// Refund request is not in a state that allows the operation
    #[error("refund operation not allowed in state {0}")]
    InvalidRefundState(String),

    /// Webhook signature or merchant credential check failed
    #[error("webhook authentication failed")]
    WebhookAuthentication,

    /// Invoice was already delivered and is immutable
    #[error("invoice already sent")]
    InvoiceAlreadySent,

    /// No invoice was issued for the payment
    #[error("no invoice for payment {0}")]
    InvoiceNotFound(PaymentId),

    /// Configuration value missing or malformed
    #[error("configuration error: {0}")]
    Config(String),
}

impl PaymentError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            Self::GatewayRejected { .. } => "GATEWAY_REJECTED",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::ReconciliationDiscrepancy { .. } => "RECONCILIATION_DISCREPANCY",
            Self::RefundAmountExceeded { .. } => "REFUND_AMOUNT_EXCEEDED",
            Self::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            Self::ReferenceNotFound(_) => "REFERENCE_NOT_FOUND",
            Self::RefundNotFound(_) => "REFUND_NOT_FOUND",
            Self::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::PaymentTerminal(_) => "PAYMENT_TERMINAL",
            Self::NotAwaitingConfirmation(_) => "NOT_AWAITING_CONFIRMATION",
            Self::InvalidRefundState(_) => "INVALID_REFUND_STATE",
            Self::WebhookAuthentication => "WEBHOOK_AUTHENTICATION",
            Self::InvoiceAlreadySent => "INVOICE_ALREADY_SENT",
            Self::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the operation may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable(_))
    }
}
