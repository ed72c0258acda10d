use crate::config::ConfigError;
use crate::reconciliation::audit::AuditExportError;
use crate::reconciliation::dispatch::NotifyError;
use crate::reconciliation::router::status_for;
use crate::reconciliation::service::ReconciliationError;
use crate::telemetry::TelemetryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Payload(serde_json::Error),
    Audit(AuditExportError),
    Dispatch(NotifyError),
    Reconciliation(ReconciliationError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Payload(err) => write!(f, "payload error: {}", err),
            AppError::Audit(err) => write!(f, "audit export error: {}", err),
            AppError::Dispatch(err) => write!(f, "dispatch setup error: {}", err),
            AppError::Reconciliation(err) => write!(f, "reconciliation error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Payload(err) => Some(err),
            AppError::Audit(err) => Some(err),
            AppError::Dispatch(err) => Some(err),
            AppError::Reconciliation(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Reconciliation(err) => status_for(err),
            AppError::Payload(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_)
            | AppError::Audit(_)
            | AppError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Payload(value)
    }
}

impl From<AuditExportError> for AppError {
    fn from(value: AuditExportError) -> Self {
        Self::Audit(value)
    }
}

impl From<NotifyError> for AppError {
    fn from(value: NotifyError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<ReconciliationError> for AppError {
    fn from(value: ReconciliationError) -> Self {
        Self::Reconciliation(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciliation::domain::CustomerId;

    #[test]
    fn reconciliation_errors_keep_their_status() {
        let err = AppError::from(ReconciliationError::UnknownObligation {
            customer_id: CustomerId::new("cust-9"),
        });
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn malformed_payloads_are_bad_requests() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(
            AppError::from(parse).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
