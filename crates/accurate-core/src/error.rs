//! Unified error handling for Accurate
//!
//! Every error renders with a stable upper-case prefix (`NOT_FOUND`,
//! `SERVER_ERROR: ...`) so RPC callers can pattern match on the string form.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Main application error type
///
/// All errors in the engine are converted to this type. It is `Clone`
/// so deduplicated RPC replies can hand out the original failure again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    // ==================== Lookup Errors ====================
    #[error("NOT_FOUND")]
    NotFound,

    #[error("EXISTS")]
    Exists,

    #[error("INVALID_KEY")]
    InvalidKey,

    #[error("ACCOUNT_NOT_FOUND")]
    AccountNotFound,

    #[error("USER_NOT_FOUND")]
    UserNotFound,

    #[error("RATING_PLAN_NOT_FOUND")]
    RatingPlanNotFound,

    // ==================== Business Logic Errors ====================
    #[error("ACCOUNT_DISABLED")]
    AccountDisabled,

    #[error("INSUFFICIENT_CREDIT")]
    InsufficientCredit,

    #[error("QUOTA_EXCEEDED")]
    QuotaExceeded,

    #[error("UNAUTHORIZED_DESTINATION")]
    UnauthorizedDestination,

    #[error("TIMED_OUT")]
    TimedOut,

    // ==================== Validation Errors ====================
    #[error("MANDATORY_IE_MISSING: [{}]", .0.join(" "))]
    MandatoryIeMissing(Vec<String>),

    #[error("INVALID_ARGUMENT: {0}")]
    InvalidArgument(String),

    #[error("PARSER_ERROR: {0}")]
    ParserError(String),

    #[error("NOT_IMPLEMENTED")]
    NotImplemented,

    // ==================== Internal Errors ====================
    #[error("SERVER_ERROR: {0}")]
    ServerError(String),

    #[error("SERVER_ERROR: database: {0}")]
    Database(String),

    #[error("SERVER_ERROR: cache: {0}")]
    Cache(String),

    #[error("SERVER_ERROR: serialization: {0}")]
    Serialization(String),

    #[error("SERVER_ERROR: config: {0}")]
    Config(String),
}

impl AppError {
    /// Builds a `MANDATORY_IE_MISSING` error out of field names
    pub fn missing<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AppError::MandatoryIeMissing(fields.into_iter().map(Into::into).collect())
    }

    pub fn server<E: std::fmt::Display>(err: E) -> Self {
        AppError::ServerError(err.to_string())
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::MandatoryIeMissing(_)
            | AppError::InvalidArgument(_)
            | AppError::ParserError(_)
            | AppError::InvalidKey => StatusCode::BAD_REQUEST,

            // 402 Payment Required
            AppError::InsufficientCredit => StatusCode::PAYMENT_REQUIRED,

            // 403 Forbidden
            AppError::AccountDisabled | AppError::UnauthorizedDestination => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::NotFound
            | AppError::AccountNotFound
            | AppError::UserNotFound
            | AppError::RatingPlanNotFound => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::Exists => StatusCode::CONFLICT,

            // 429 Too Many Requests
            AppError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,

            AppError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            AppError::TimedOut => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::NotFound => "NOT_FOUND",
            AppError::Exists => "EXISTS",
            AppError::InvalidKey => "INVALID_KEY",
            AppError::AccountNotFound => "ACCOUNT_NOT_FOUND",
            AppError::UserNotFound => "USER_NOT_FOUND",
            AppError::RatingPlanNotFound => "RATING_PLAN_NOT_FOUND",
            AppError::AccountDisabled => "ACCOUNT_DISABLED",
            AppError::InsufficientCredit => "INSUFFICIENT_CREDIT",
            AppError::QuotaExceeded => "QUOTA_EXCEEDED",
            AppError::UnauthorizedDestination => "UNAUTHORIZED_DESTINATION",
            AppError::TimedOut => "TIMED_OUT",
            AppError::MandatoryIeMissing(_) => "MANDATORY_IE_MISSING",
            AppError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AppError::ParserError(_) => "PARSER_ERROR",
            AppError::NotImplemented => "NOT_IMPLEMENTED",
            AppError::ServerError(_)
            | AppError::Database(_)
            | AppError::Cache(_)
            | AppError::Serialization(_)
            | AppError::Config(_) => "SERVER_ERROR",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let body = json!({
            "error": self.error_code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });

        HttpResponse::build(status).json(body)
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::ServerError(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::Database(other.to_string()),
        }
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(err: rust_decimal::Error) -> Self {
        AppError::ParserError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_prefixes() {
        assert_eq!(AppError::NotFound.to_string(), "NOT_FOUND");
        assert_eq!(
            AppError::server("boom").to_string(),
            "SERVER_ERROR: boom"
        );
        assert_eq!(
            AppError::missing(["Account", "Destination"]).to_string(),
            "MANDATORY_IE_MISSING: [Account Destination]"
        );
        assert!(AppError::Database("conn refused".into())
            .to_string()
            .starts_with("SERVER_ERROR"));
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(AppError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::InsufficientCredit.status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            AppError::missing(["Tenant"]).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Cache("x".into()).error_code(), "SERVER_ERROR");
        assert_eq!(AppError::AccountDisabled.error_code(), "ACCOUNT_DISABLED");
    }
}
