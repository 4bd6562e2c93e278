//! Typed errors for the reconciliation engine (spec §7).
//!
//! HTTP transport is out of scope, but the teacher's `IntoResponse` envelope is
//! kept: it doubles as the structured representation callers (tests, batch
//! import drivers) use to inspect what went wrong.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    pub request_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// The six error kinds of spec §7, each carrying enough context to log and to
/// render an Italian user-facing message.
#[derive(Debug)]
pub enum AppError {
    /// Unknown sheet, missing required column, formula linked to an external
    /// workbook, empty file, malformed WBS code, duplicate progressivo.
    InvalidInput(String),
    /// Commessa/computo/price-list-item id absent, or wrong commessa.
    NotFound(String),
    /// Second return for an existing `(bidder, round)` without `round_mode=replace`;
    /// bundle import over an existing commessa code without `overwrite=true`.
    Conflict(String),
    /// Return import without a live project computo; search before any
    /// catalog item carries a compatible embedding.
    PreconditionFailed(String),
    /// FAISS load failed / LLM timeout / DB deadlock — caller may retry.
    TransientBackend(String),
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            AppError::TransientBackend(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            AppError::TransientBackend(_) => "TRANSIENT_BACKEND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Short Italian message, per spec §7 ("user-visible failure always
    /// includes a short Italian message").
    fn message(&self) -> String {
        match self {
            AppError::InvalidInput(msg) => format!("Dati non validi: {msg}"),
            AppError::NotFound(msg) => format!("Risorsa non trovata: {msg}"),
            AppError::Conflict(msg) => format!("Conflitto: {msg}"),
            AppError::PreconditionFailed(msg) => format!("Precondizione non soddisfatta: {msg}"),
            AppError::TransientBackend(msg) => format!("Servizio temporaneamente non disponibile: {msg}"),
            AppError::Internal(_) => "Errore interno del server".to_string(),
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Internal(msg) => Some(serde_json::json!({ "internal": msg })),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::TransientBackend(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.message(),
                details: self.details(),
            },
            request_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };

        tracing::error!(
            request_id = %response.request_id,
            error_code = %response.error.code,
            status = %status,
            "reconciliation error"
        );

        (status, Json(response)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON non valido: {err}"))
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        AppError::TransientBackend(err.to_string())
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(err: tokio_postgres::Error) -> Self {
        AppError::Internal(format!("database: {err}"))
    }
}

#[allow(dead_code)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::TransientBackend("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_retryable() {
        assert!(AppError::TransientBackend("x".into()).is_retryable());
        assert!(!AppError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_italian_message() {
        let err = AppError::NotFound("commessa 1".into());
        assert!(err.to_string().contains("non trovata"));
    }
}
