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

//! Invoice generation.
//!
//! One invoice per confirmed payment. The paid amount is the invoice total;
//! tax is carved out of it at the configured rate. Once marked sent an
//! invoice never changes.

use crate::PaymentError;
use crate::base::{Currency, Payable, PaymentId};
use crate::payment::{PaymentSnapshot, TransactionStatus};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    pub invoice_number: String,
    pub payment_id: PaymentId,
    pub payable: Payable,
    pub currency: Currency,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub issued_date: NaiveDate,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct InvoiceGenerator {
    invoices: DashMap<PaymentId, Invoice>,
    sequence: AtomicU64,
    tax_rate: Decimal,
    due_days: u32,
}

impl InvoiceGenerator {
    pub fn new(tax_rate: Decimal, due_days: u32) -> Self {
        Self {
            invoices: DashMap::new(),
            sequence: AtomicU64::new(1),
            tax_rate,
            due_days,
        }
    }

    /// Issues the invoice for a confirmed payment, or returns the one already issued.
    pub fn issue(&self, payment: &PaymentSnapshot, now: DateTime<Utc>) -> Result<Invoice, PaymentError> {
        if payment.status != TransactionStatus::Confirmed {
            return Err(PaymentError::Validation(format!(
                "payment {} is {:?}, invoices require CONFIRMED",
                payment.id, payment.status
            )));
        }

        let issued_date = now.date_naive();
        let due_date = issued_date
            .checked_add_signed(TimeDelta::days(i64::from(self.due_days)))
            .ok_or_else(|| {
                PaymentError::Validation(format!(
                    "due date {} days after {issued_date} is out of range",
                    self.due_days
                ))
            })?;

        match self.invoices.entry(payment.id) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                let (subtotal, tax_amount) = self.split(payment.amount);
                let invoice = Invoice {
                    invoice_number: format!("INV-{}-{sequence:06}", issued_date.format("%Y%m%d")),
                    payment_id: payment.id,
                    payable: payment.payable.clone(),
                    currency: payment.currency.clone(),
                    subtotal,
                    tax_amount,
                    total_amount: payment.amount,
                    issued_date,
                    due_date,
                    paid_date: payment.completed_at.map(|t| t.date_naive()),
                    notes: payment.notes.clone(),
                    sent: false,
                    sent_at: None,
                };
                tracing::info!(
                    payment_id = %payment.id,
                    invoice_number = %invoice.invoice_number,
                    total = %invoice.total_amount,
                    "invoice issued"
                );
                entry.insert(invoice.clone());
                Ok(invoice)
            }
        }
    }

    /// Tax-inclusive split of `total` into `(subtotal, tax)`.
    fn split(&self, total: Decimal) -> (Decimal, Decimal) {
        if self.tax_rate.is_zero() {
            return (total, Decimal::ZERO);
        }
        let subtotal = (total / (Decimal::ONE + self.tax_rate))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        (subtotal, total - subtotal)
    }

    pub fn get(&self, payment_id: PaymentId) -> Option<Invoice> {
        self.invoices.get(&payment_id).map(|i| i.clone())
    }

    /// Flags the invoice as delivered to the customer.
    ///
    /// # Errors
    ///
    /// [`PaymentError::InvoiceAlreadySent`] on a second call.
    pub fn mark_sent(&self, payment_id: PaymentId, now: DateTime<Utc>) -> Result<Invoice, PaymentError> {
        let mut invoice = self
            .invoices
            .get_mut(&payment_id)
            .ok_or(PaymentError::InvoiceNotFound(payment_id))?;
        if invoice.sent {
            return Err(PaymentError::InvoiceAlreadySent);
        }
        invoice.sent = true;
        invoice.sent_at = Some(now);
        Ok(invoice.clone())
    }

    pub fn len(&self) -> usize {
        self.invoices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }
}
