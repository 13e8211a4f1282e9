//! Self-contained settlement API with a sandbox MTN MoMo provider.
//!
//! Run with: `cargo run --example server`
//!
//! The sandbox accepts every collection and leaves it awaiting confirmation;
//! confirm it by posting a signed MTN callback. Webhook secret: `demo-secret`.
//!
//! ## Example Usage
//!
//! ```bash
//! # Create a payment
//! curl -X POST http://localhost:3000/payments \
//!   -H "Content-Type: application/json" \
//!   -d '{"idempotency_key": "order-1042-1", "amount": "5000", "currency": "RWF",
//!        "provider": "mtn_momo", "method": "mobile_money",
//!        "payable": {"kind": "order", "reference": "1042"}, "payer": "250781234567"}'
//!
//! # Confirm it (use the external_ref from the response)
//! BODY='{"referenceId":"<external_ref>","financialTransactionId":"1","status":"SUCCESSFUL"}'
//! SIG=$(printf '%s' "$BODY" | openssl dgst -sha256 -hmac demo-secret | cut -d' ' -f2)
//! curl -X POST http://localhost:3000/webhooks/mtn_momo \
//!   -H "X-Callback-Signature: $SIG" -d "$BODY"
//!
//! # Invoice and audit log
//! curl http://localhost:3000/payments/1/invoice
//! curl http://localhost:3000/payments/1/transactions
//! ```

use payment_settlement_rs::adapter::mtn::MtnMomoAdapter;
use payment_settlement_rs::api::{self, AppState};
use payment_settlement_rs::config::MtnMomoConfig;
use payment_settlement_rs::observability::{LogFormat, init_logging};
use payment_settlement_rs::sweeper::TimeoutSweeper;
use payment_settlement_rs::transaction::Payload;
use payment_settlement_rs::{
    AdapterRegistry, Config, ExternalRef, GatewayResponse, GatewayStatus, InitiateRequest, Orchestrator,
    PaymentError, Provider, ProviderAdapter, RefundCall, WebhookNotification,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Accepts everything; webhooks are checked and parsed the MTN way.
struct SandboxMtn {
    callbacks: MtnMomoAdapter,
}

impl ProviderAdapter for SandboxMtn {
    fn provider(&self) -> Provider {
        Provider::MtnMomo
    }

    fn initiate(&self, request: &InitiateRequest) -> GatewayResponse {
        GatewayResponse::new(GatewayStatus::Accepted, Payload::from("sandbox request-to-pay"))
            .external_ref(request.reference.clone())
    }

    fn query(&self, _external_ref: &ExternalRef) -> GatewayResponse {
        GatewayResponse::new(GatewayStatus::Pending, Payload::from("sandbox query")).provider_code("PENDING")
    }

    fn refund(&self, request: &RefundCall) -> GatewayResponse {
        GatewayResponse::new(GatewayStatus::Accepted, Payload::from("sandbox refund"))
            .external_ref(request.refund_reference.clone())
    }

    fn signature_header(&self) -> &'static str {
        self.callbacks.signature_header()
    }

    fn authenticate(&self, body: &[u8], signature: Option<&str>) -> bool {
        self.callbacks.authenticate(body, signature)
    }

    fn parse_notification(&self, body: &[u8]) -> Result<WebhookNotification, PaymentError> {
        self.callbacks.parse_notification(body)
    }
}

fn main() {
    init_logging(LogFormat::Pretty);

    let config = Config {
        confirmation_window: Duration::from_secs(300),
        ..Config::default()
    };
    let callbacks = MtnMomoAdapter::new(
        MtnMomoConfig {
            base_url: "http://127.0.0.1:9".into(),
            api_user: "sandbox".into(),
            api_key: "sandbox".into(),
            subscription_key: "sandbox".into(),
            webhook_secret: "demo-secret".into(),
            target_environment: "sandbox".into(),
        },
        config.gateway_timeout,
    )
    .unwrap();
    let adapters = AdapterRegistry::new().with(Arc::new(SandboxMtn { callbacks }));
    let orchestrator = Arc::new(Orchestrator::new(adapters, &config));
    let sweeper = TimeoutSweeper::spawn(Arc::clone(&orchestrator), config.sweep_interval).unwrap();
    let state = AppState::new(orchestrator, config.reconciliation_tolerance);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let app = api::router(state.clone());
    runtime.block_on(async move {
        let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
        println!("Settlement API running on http://127.0.0.1:3000");
        println!();
        println!("Endpoints:");
        println!("  POST /payments                 - Create and submit a payment");
        println!("  GET  /payments/:id             - Payment snapshot");
        println!("  POST /webhooks/mtn_momo        - Signed MTN callback");
        println!("  GET  /payments/:id/invoice     - Invoice of a confirmed payment");
        println!("  POST /reconciliations/csv      - Reconcile a statement");
        println!("  POST /refunds                  - Request a refund");

        axum::serve(listener, app).await.unwrap();
    });

    drop(runtime);
    sweeper.stop();
}
