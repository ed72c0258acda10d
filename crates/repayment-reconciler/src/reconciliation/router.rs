use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::alerts::AlertPublisher;
use super::audit::ledger_csv;
use super::channels::{ChannelPayload, NormalizationError};
use super::domain::{Channel, CustomerId, PaymentNotification, TransactionId};
use super::service::{ReconciliationError, ReconciliationOutcome, ReconciliationService};
use super::store::{LedgerStore, StoreError};

type SharedService<S, A> = Arc<ReconciliationService<S, A>>;

/// Router exposing channel callbacks, status lookups and the audit export.
pub fn reconciliation_router<S, A>(service: SharedService<S, A>) -> Router
where
    S: LedgerStore + 'static,
    A: AlertPublisher + 'static,
{
    Router::new()
        .route(
            "/api/v1/channels/:channel/notifications",
            post(channel_notification_handler::<S, A>),
        )
        .route(
            "/api/v1/notifications",
            post(notification_handler::<S, A>),
        )
        .route(
            "/api/v1/transactions/:transaction_id",
            get(transaction_handler::<S, A>),
        )
        .route(
            "/api/v1/customers/:customer_id/statement",
            get(statement_handler::<S, A>),
        )
        .route("/api/v1/audit/ledger.csv", get(ledger_csv_handler::<S, A>))
        .with_state(service)
}

/// Response status for each error kind; duplicates never reach here.
pub fn status_for(err: &ReconciliationError) -> StatusCode {
    match err {
        ReconciliationError::LockContention { .. } => StatusCode::CONFLICT,
        ReconciliationError::UnknownObligation { .. }
        | ReconciliationError::UnknownAccount { .. }
        | ReconciliationError::Store(StoreError::TransactionNotFound(_)) => StatusCode::NOT_FOUND,
        ReconciliationError::OverpaymentRejected { .. }
        | ReconciliationError::AmountMismatch { .. }
        | ReconciliationError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReconciliationError::Store(StoreError::StaleObligation { .. })
        | ReconciliationError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        ReconciliationError::LedgerMismatch { .. }
        | ReconciliationError::InvalidState(_)
        | ReconciliationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ReconciliationError) -> Response {
    let payload = json!({
        "error": err.to_string(),
        "kind": err.kind(),
        "retryable": err.is_retryable(),
    });
    (status_for(err), Json(payload)).into_response()
}

fn outcome_response(result: Result<ReconciliationOutcome, ReconciliationError>) -> Response {
    match result {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => error_response(&err),
    }
}

fn worker_panicked(err: tokio::task::JoinError) -> Response {
    error!(error = %err, "reconciliation worker aborted");
    let payload = json!({ "error": "reconciliation worker aborted", "kind": "internal", "retryable": true });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
}

pub(crate) async fn channel_notification_handler<S, A>(
    State(service): State<SharedService<S, A>>,
    Path(channel): Path<String>,
    Json(payload): Json<ChannelPayload>,
) -> Response
where
    S: LedgerStore + 'static,
    A: AlertPublisher + 'static,
{
    let expected = Channel::from_slug(&channel);
    let found = payload.channel();
    if expected != found {
        let err = ReconciliationError::from(NormalizationError::ChannelMismatch { expected, found });
        return error_response(&err);
    }

    match tokio::task::spawn_blocking(move || service.reconcile_payload(payload)).await {
        Ok(result) => outcome_response(result),
        Err(err) => worker_panicked(err),
    }
}

pub(crate) async fn notification_handler<S, A>(
    State(service): State<SharedService<S, A>>,
    Json(notification): Json<PaymentNotification>,
) -> Response
where
    S: LedgerStore + 'static,
    A: AlertPublisher + 'static,
{
    match tokio::task::spawn_blocking(move || service.reconcile(notification)).await {
        Ok(result) => outcome_response(result),
        Err(err) => worker_panicked(err),
    }
}

pub(crate) async fn transaction_handler<S, A>(
    State(service): State<SharedService<S, A>>,
    Path(transaction_id): Path<String>,
) -> Response
where
    S: LedgerStore + 'static,
    A: AlertPublisher + 'static,
{
    let id = TransactionId(transaction_id);
    match service.transaction(&id) {
        Ok(transaction) => (StatusCode::OK, Json(transaction)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StatementQuery {
    #[serde(default)]
    pub(crate) as_of: Option<NaiveDate>,
}

pub(crate) async fn statement_handler<S, A>(
    State(service): State<SharedService<S, A>>,
    Path(customer_id): Path<String>,
    Query(query): Query<StatementQuery>,
) -> Response
where
    S: LedgerStore + 'static,
    A: AlertPublisher + 'static,
{
    let as_of = query.as_of.unwrap_or_else(|| Utc::now().date_naive());
    match service.statement(&CustomerId(customer_id), as_of) {
        Ok(statement) => (StatusCode::OK, Json(statement)).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(crate) async fn ledger_csv_handler<S, A>(State(service): State<SharedService<S, A>>) -> Response
where
    S: LedgerStore + 'static,
    A: AlertPublisher + 'static,
{
    let entries = match service.ledger_entries() {
        Ok(entries) => entries,
        Err(err) => return error_response(&err),
    };

    match ledger_csv(&entries) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "ledger export failed");
            let payload = json!({ "error": err.to_string(), "kind": "audit_export" });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
        }
    }
}
