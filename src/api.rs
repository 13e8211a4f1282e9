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

//! HTTP surface.
//!
//! | Method | Path                               | Operation                          |
//! |--------|------------------------------------|------------------------------------|
//! | POST   | `/payments`                        | create and submit a payment        |
//! | GET    | `/payments?status=`                | list payments                      |
//! | GET    | `/payments/{id}`                   | payment snapshot                   |
//! | GET    | `/payments/{id}/transactions`      | audit log                          |
//! | POST   | `/payments/{id}/poll`              | query the gateway                  |
//! | GET    | `/payments/{id}/invoice`           | invoice                            |
//! | POST   | `/payments/{id}/invoice/sent`      | mark invoice delivered             |
//! | GET    | `/payments/{id}/refunds`           | refunds and refunded total         |
//! | POST   | `/webhooks/{provider}`             | provider callback                  |
//! | POST   | `/reconciliations`                 | reconcile a JSON statement         |
//! | POST   | `/reconciliations/csv?…`           | reconcile a CSV statement          |
//! | GET    | `/reconciliations`                 | run history                        |
//! | GET    | `/reconciliations/{id}`            | one run                            |
//! | POST   | `/refunds`                         | request a refund                   |
//! | GET    | `/refunds/{id}`                    | refund request                     |
//! | POST   | `/refunds/{id}/approve`            | staff approval                     |
//! | POST   | `/refunds/{id}/reject`             | staff rejection                    |
//! | POST   | `/refunds/{id}/execute`            | send an approved refund            |
//!
//! Gateway calls block, so handlers that reach an adapter run on the
//! blocking pool.

use crate::PaymentError;
use crate::base::{PaymentId, Provider, RefundId, RunId};
use crate::invoice::Invoice;
use crate::orchestrator::Orchestrator;
use crate::payment::{NewPayment, PaymentSnapshot, SignalOutcome, TransactionStatus};
use crate::reconciliation::{ReconciliationEngine, ReconciliationRun, Statement};
use crate::refund::{NewRefund, RefundRequest, RefundWorkflow};
use crate::transaction::PaymentTransaction;
use crate::webhook::WebhookReceiver;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Response body for errors.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<TransactionStatus>,
}

/// Staff decision on a refund request.
#[derive(Debug, Deserialize)]
pub struct Decision {
    pub approver: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CsvStatementQuery {
    pub provider: String,
    pub file_name: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct RefundSummary {
    pub payment_id: PaymentId,
    pub refunded_total: Decimal,
    pub refunds: Vec<RefundRequest>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub webhooks: Arc<WebhookReceiver>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub refunds: Arc<RefundWorkflow>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, reconciliation_tolerance: Decimal) -> Self {
        Self {
            webhooks: Arc::new(WebhookReceiver::new(Arc::clone(&orchestrator))),
            reconciliation: Arc::new(ReconciliationEngine::new(
                Arc::clone(&orchestrator),
                reconciliation_tolerance,
            )),
            refunds: Arc::new(RefundWorkflow::new(Arc::clone(&orchestrator))),
            orchestrator,
        }
    }
}

// === Error Handling ===

pub enum AppError {
    Payment(PaymentError),
    /// A blocking task panicked or was cancelled.
    Internal(String),
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        AppError::Payment(err)
    }
}

fn status_of(err: &PaymentError) -> StatusCode {
    match err {
        PaymentError::Validation(_) => StatusCode::BAD_REQUEST,
        PaymentError::WebhookAuthentication => StatusCode::UNAUTHORIZED,
        PaymentError::PaymentNotFound(_)
        | PaymentError::ReferenceNotFound(_)
        | PaymentError::RefundNotFound(_)
        | PaymentError::InvoiceNotFound(_)
        | PaymentError::UnknownProvider(_) => StatusCode::NOT_FOUND,
        PaymentError::InvalidTransition { .. }
        | PaymentError::PaymentTerminal(_)
        | PaymentError::NotAwaitingConfirmation(_)
        | PaymentError::InvalidRefundState(_)
        | PaymentError::InvoiceAlreadySent => StatusCode::CONFLICT,
        PaymentError::RefundAmountExceeded { .. } | PaymentError::ReconciliationDiscrepancy { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PaymentError::GatewayRejected { .. } => StatusCode::BAD_GATEWAY,
        PaymentError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PaymentError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        PaymentError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Payment(err) => (
                status_of(&err),
                ErrorResponse {
                    error: err.to_string(),
                    code: err.code().to_string(),
                },
            ),
            AppError::Internal(message) => {
                tracing::error!(error = %message, "request task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: message,
                        code: "INTERNAL_ERROR".to_string(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, PaymentError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::from)
}

// === Payments ===

/// POST /payments
async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<NewPayment>,
) -> Result<(StatusCode, Json<PaymentSnapshot>), AppError> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let payment = blocking(move || orchestrator.pay(request)).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// GET /payments
async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<PaymentSnapshot>> {
    Json(state.orchestrator.payments(query.status))
}

/// GET /payments/{id}
async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<PaymentSnapshot>, AppError> {
    Ok(Json(state.orchestrator.payment(PaymentId(id))?))
}

/// GET /payments/{id}/transactions
async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<PaymentTransaction>>, AppError> {
    Ok(Json(state.orchestrator.transactions(PaymentId(id))?))
}

/// POST /payments/{id}/poll
async fn poll_payment(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<PaymentSnapshot>, AppError> {
    let orchestrator = Arc::clone(&state.orchestrator);
    Ok(Json(blocking(move || orchestrator.poll(PaymentId(id))).await?))
}

/// GET /payments/{id}/invoice
async fn get_invoice(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<Invoice>, AppError> {
    Ok(Json(state.orchestrator.invoice(PaymentId(id))?))
}

/// POST /payments/{id}/invoice/sent
async fn mark_invoice_sent(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Invoice>, AppError> {
    Ok(Json(state.orchestrator.mark_invoice_sent(PaymentId(id))?))
}

/// GET /payments/{id}/refunds
async fn payment_refunds(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<RefundSummary>, AppError> {
    let payment_id = PaymentId(id);
    state.orchestrator.payment(payment_id)?;
    Ok(Json(RefundSummary {
        payment_id,
        refunded_total: state.refunds.refunded_total(payment_id),
        refunds: state.refunds.for_payment(payment_id),
    }))
}

// === Webhooks ===

/// POST /webhooks/{provider}
async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SignalOutcome>, AppError> {
    let provider: Provider = provider.parse()?;
    let header = state.webhooks.signature_header(provider)?;
    let signature = headers.get(header).and_then(|v| v.to_str().ok());
    Ok(Json(state.webhooks.receive(provider, &body, signature)?))
}

// === Reconciliation ===

/// POST /reconciliations
async fn reconcile_statement(
    State(state): State<AppState>,
    Json(statement): Json<Statement>,
) -> Result<(StatusCode, Json<ReconciliationRun>), AppError> {
    let run = state.reconciliation.run(&statement)?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// POST /reconciliations/csv
async fn reconcile_csv(
    State(state): State<AppState>,
    Query(query): Query<CsvStatementQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<ReconciliationRun>), AppError> {
    let statement = Statement::from_csv(
        body.as_ref(),
        query.provider.parse()?,
        query.file_name,
        query.period_start,
        query.period_end,
    )?;
    let run = state.reconciliation.run(&statement)?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /reconciliations
async fn list_runs(State(state): State<AppState>) -> Json<Vec<ReconciliationRun>> {
    Json(state.reconciliation.runs())
}

/// GET /reconciliations/{id}
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ReconciliationRun>, (StatusCode, Json<ErrorResponse>)> {
    state.reconciliation.get(RunId(id)).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("reconciliation run {id} not found"),
                code: "RUN_NOT_FOUND".to_string(),
            }),
        )
    })
}

// === Refunds ===

/// POST /refunds
async fn request_refund(
    State(state): State<AppState>,
    Json(refund): Json<NewRefund>,
) -> Result<(StatusCode, Json<RefundRequest>), AppError> {
    Ok((StatusCode::CREATED, Json(state.refunds.request(refund)?)))
}

/// GET /refunds/{id}
async fn get_refund(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<RefundRequest>, AppError> {
    Ok(Json(state.refunds.get(RefundId(id))?))
}

/// POST /refunds/{id}/approve
async fn approve_refund(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(decision): Json<Decision>,
) -> Result<Json<RefundRequest>, AppError> {
    Ok(Json(state.refunds.approve(
        RefundId(id),
        &decision.approver,
        decision.notes,
    )?))
}

/// POST /refunds/{id}/reject
async fn reject_refund(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(decision): Json<Decision>,
) -> Result<Json<RefundRequest>, AppError> {
    Ok(Json(state.refunds.reject(
        RefundId(id),
        &decision.approver,
        decision.notes,
    )?))
}

/// POST /refunds/{id}/execute
async fn execute_refund(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<RefundRequest>, AppError> {
    let refunds = Arc::clone(&state.refunds);
    Ok(Json(blocking(move || refunds.execute(RefundId(id))).await?))
}

// === Router ===

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/payments", post(create_payment).get(list_payments))
        .route("/payments/{id}", get(get_payment))
        .route("/payments/{id}/transactions", get(list_transactions))
        .route("/payments/{id}/poll", post(poll_payment))
        .route("/payments/{id}/invoice", get(get_invoice))
        .route("/payments/{id}/invoice/sent", post(mark_invoice_sent))
        .route("/payments/{id}/refunds", get(payment_refunds))
        .route("/webhooks/{provider}", post(receive_webhook))
        .route("/reconciliations", post(reconcile_statement).get(list_runs))
        .route("/reconciliations/csv", post(reconcile_csv))
        .route("/reconciliations/{id}", get(get_run))
        .route("/refunds", post(request_refund))
        .route("/refunds/{id}", get(get_refund))
        .route("/refunds/{id}/approve", post(approve_refund))
        .route("/refunds/{id}/reject", post(reject_refund))
        .route("/refunds/{id}/execute", post(execute_refund))
        .with_state(state)
}
