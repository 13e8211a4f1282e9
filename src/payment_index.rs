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

//! Thread-safe payment store with idempotency and reference indexes.
//!
//! Payments are handed out as `Arc<Payment>` so callers never hold a map
//! shard guard while taking a payment's own lock.

use crate::PaymentError;
use crate::base::{ExternalRef, IdempotencyKey, PaymentId, Provider};
use crate::payment::{NewPayment, Payment, TransactionStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of [`PaymentIndex::insert_or_get`].
#[derive(Debug, Clone)]
pub enum Insertion {
    Created(Arc<Payment>),
    /// A payment with the same idempotency key already existed.
    Existing(Arc<Payment>),
}

impl Insertion {
    pub fn payment(&self) -> &Arc<Payment> {
        match self {
            Self::Created(p) | Self::Existing(p) => p,
        }
    }

    pub fn into_payment(self) -> Arc<Payment> {
        match self {
            Self::Created(p) | Self::Existing(p) => p,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Payment registry keyed by id, idempotency key and `(provider, external_ref)`.
#[derive(Debug)]
pub struct PaymentIndex {
    payments: DashMap<PaymentId, Arc<Payment>>,
    by_key: DashMap<IdempotencyKey, PaymentId>,
    by_reference: DashMap<(Provider, ExternalRef), PaymentId>,
    next_id: AtomicU64,
}

impl PaymentIndex {
    pub fn new() -> Self {
        Self {
            payments: DashMap::new(),
            by_key: DashMap::new(),
            by_reference: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a payment unless one with the same idempotency key exists.
    ///
    /// Check and insert happen under the key's shard lock, so two concurrent
    /// requests with one key always observe a single payment.
    pub fn insert_or_get(
        &self,
        request: NewPayment,
        now: DateTime<Utc>,
    ) -> Result<Insertion, PaymentError> {
        match self.by_key.entry(request.idempotency_key.clone()) {
            Entry::Occupied(entry) => {
                let id = *entry.get();
                self.get(id)
                    .map(Insertion::Existing)
                    .ok_or(PaymentError::PaymentNotFound(id))
            }
            Entry::Vacant(entry) => {
                let id = PaymentId(self.next_id.fetch_add(1, Ordering::Relaxed));
                let payment = Arc::new(Payment::new(id, request, now));
                self.payments.insert(id, Arc::clone(&payment));
                entry.insert(id);
                Ok(Insertion::Created(payment))
            }
        }
    }

    /// Binds a provider reference to a payment.
    ///
    /// # Errors
    ///
    /// [`PaymentError::Validation`] if the reference already belongs to a
    /// different payment of the same provider.
    pub fn bind_reference(
        &self,
        provider: Provider,
        external_ref: ExternalRef,
        id: PaymentId,
    ) -> Result<(), PaymentError> {
        match self.by_reference.entry((provider, external_ref)) {
            Entry::Occupied(entry) if *entry.get() != id => {
                Err(PaymentError::Validation(format!(
                    "{} reference {} already bound to payment {}",
                    provider,
                    entry.key().1,
                    entry.get()
                )))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(id);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: PaymentId) -> Option<Arc<Payment>> {
        self.payments.get(&id).map(|p| Arc::clone(p.value()))
    }

    pub fn by_key(&self, key: &IdempotencyKey) -> Option<Arc<Payment>> {
        let id = *self.by_key.get(key)?;
        self.get(id)
    }

    pub fn by_reference(&self, provider: Provider, external_ref: &ExternalRef) -> Option<Arc<Payment>> {
        let id = *self.by_reference.get(&(provider, external_ref.clone()))?;
        self.get(id)
    }

    /// All payments in creation order.
    pub fn all(&self) -> Vec<Arc<Payment>> {
        let mut payments: Vec<_> = self.payments.iter().map(|p| Arc::clone(p.value())).collect();
        payments.sort_by_key(|p| p.id());
        payments
    }

    pub fn with_status(&self, status: TransactionStatus) -> Vec<Arc<Payment>> {
        self.all().into_iter().filter(|p| p.status() == status).collect()
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }
}

impl Default for PaymentIndex {
    fn default() -> Self {
        Self::new()
    }
}
