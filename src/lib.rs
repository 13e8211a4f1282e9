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
//! # Payment Settlement
//!
//! This library settles payments through mobile-money and bank-transfer
//! providers: it drives each payment through its gateway lifecycle, ingests
//! provider webhooks, issues invoices, reconciles provider statements and
//! runs the refund approval workflow.
//!
//! ## Core Components
//!
//! - [`Orchestrator`]: payment state machine driver and the only writer of payments
//! - [`ProviderAdapter`]: one implementation per gateway (MTN MoMo, Airtel Money, Flutterwave)
//! - [`WebhookReceiver`]: authenticated, deduplicated provider callbacks
//! - [`ReconciliationEngine`]: idempotent statement matching
//! - [`RefundWorkflow`]: refunds bounded by the confirmed amount
//! - [`PaymentError`]: error taxonomy shared by every component
//!
//! ## Example
//!
//! ```
//! use payment_settlement_rs::{
//!     AdapterRegistry, Config, Currency, IdempotencyKey, NewPayment, Orchestrator, Payable,
//!     PaymentMethod, Provider, TransactionStatus,
//! };
//! use rust_decimal_macros::dec;
//!
//! let orchestrator = Orchestrator::new(AdapterRegistry::new(), &Config::default());
//!
//! // No adapter is registered, so the provider is rejected before anything is recorded.
//! let request = NewPayment {
//!     idempotency_key: IdempotencyKey::new("order-1042-attempt-1"),
//!     amount: dec!(5000),
//!     currency: Currency::rwf(),
//!     provider: Provider::MtnMomo,
//!     method: PaymentMethod::MobileMoney,
//!     payable: Payable::Order("1042".into()),
//!     payer: "250781234567".into(),
//!     notes: None,
//! };
//! assert!(orchestrator.create_payment(request).is_err());
//! assert!(orchestrator.payments(Some(TransactionStatus::Initiated)).is_empty());
//! ```
//!
//! ## Thread Safety
//!
//! Every payment sits behind its own mutex and all transitions are
//! compare-and-swap, so webhooks, polls and the timeout sweep can race on the
//! same payment from different threads. Gateway calls never hold a lock.

pub mod adapter;
pub mod api;
mod base;
pub mod config;
pub mod error;
pub mod events;
pub mod invoice;
pub mod observability;
pub mod orchestrator;
pub mod payment;
mod payment_index;
pub mod reconciliation;
pub mod refund;
pub mod retry;
pub mod sweeper;
pub mod transaction;
pub mod webhook;

pub use adapter::{
    AdapterRegistry, AirtelMoneyAdapter, BankTransferAdapter, GatewayResponse, GatewayStatus,
    InitiateRequest, MtnMomoAdapter, ProviderAdapter, ProviderPayload, RefundCall, WebhookNotification,
};
pub use base::{
    Currency, ExternalRef, IdempotencyKey, Payable, PaymentId, PaymentMethod, Provider, RefundId, RunId,
};
pub use config::Config;
pub use error::PaymentError;
pub use events::SettlementEvent;
pub use invoice::Invoice;
pub use orchestrator::Orchestrator;
pub use payment::{NewPayment, Payment, PaymentSnapshot, SignalOutcome, TransactionStatus};
pub use reconciliation::{ReconciliationEngine, ReconciliationRun, Statement, StatementLine};
pub use refund::{NewRefund, RefundRequest, RefundStatus, RefundWorkflow};
pub use retry::RetryPolicy;
pub use transaction::{PaymentTransaction, RequestKind};
pub use webhook::WebhookReceiver;
