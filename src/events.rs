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

//! Settlement events.
//!
//! Events are published only after the state change they describe has been
//! committed and the payment lock released. Each subscriber gets its own
//! unbounded crossbeam channel.

use crate::base::{PaymentId, RefundId};
use crate::payment::TransactionStatus;
use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    /// A payment reached CONFIRMED, FAILED or TIMEOUT.
    PaymentSettled {
        payment_id: PaymentId,
        status: TransactionStatus,
    },
    InvoiceIssued {
        payment_id: PaymentId,
        invoice_number: String,
    },
    RefundCompleted {
        payment_id: PaymentId,
        refund_id: RefundId,
        amount: Decimal,
    },
    /// A provider report conflicted with a terminal status.
    ManualReviewRequired {
        payment_id: PaymentId,
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<SettlementEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<SettlementEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Delivers `event` to every live subscriber and drops disconnected ones.
    pub fn publish(&self, event: SettlementEvent) {
        tracing::debug!(?event, "publishing settlement event");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_event() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        let event = SettlementEvent::PaymentSettled {
            payment_id: PaymentId(1),
            status: TransactionStatus::Confirmed,
        };
        bus.publish(event.clone());
        assert_eq!(a.try_recv().unwrap(), event);
        assert_eq!(b.try_recv().unwrap(), event);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        let live = bus.subscribe();
        bus.publish(SettlementEvent::ManualReviewRequired {
            payment_id: PaymentId(3),
            reason: "late confirmation".into(),
        });
        assert_eq!(bus.subscribers.lock().len(), 1);
        assert!(live.try_recv().is_ok());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(SettlementEvent::InvoiceIssued {
            payment_id: PaymentId(4),
            invoice_number: "INV-20250101-000001".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "invoice_issued");
        assert_eq!(json["payment_id"], 4);
    }
}
