use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::error;

/// Field name -> human readable messages, keyed by the wire (camelCase) name.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Entities whose absence is reported with a dedicated error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Customer,
    Account,
    Card,
}

impl EntityKind {
    pub fn not_found_code(&self) -> &'static str {
        match self {
            EntityKind::Customer => "CUSTOMER_NOT_FOUND",
            EntityKind::Account => "ACCOUNT_NOT_FOUND",
            EntityKind::Card => "CARD_NOT_FOUND",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Customer => f.write_str("customer"),
            EntityKind::Account => f.write_str("account"),
            EntityKind::Card => f.write_str("card"),
        }
    }
}

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub timestamp: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<FieldErrors>,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            error_code: error_code.into(),
            detail: None,
            field_errors: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(EntityKind),

    #[error("Validation failed")]
    Validation(FieldErrors),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Card type already exists for account")]
    CardTypeAlreadyExists,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A sibling service answered with a non-success status.
    #[error("Upstream service responded with {status}")]
    Upstream {
        status: StatusCode,
        body: Option<Value>,
    },

    /// A sibling service could not be reached at all.
    #[error("Upstream service unreachable: {0}")]
    UpstreamUnavailable(String),

    #[error("Circuit breaker open")]
    CircuitBreakerOpen,

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        let mut fields = FieldErrors::new();
        for (field, errors) in err.field_errors() {
            let messages = fields.entry(camel_case(field)).or_default();
            for e in errors {
                let message = e
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string());
                messages.push(message);
            }
        }
        ServiceError::Validation(fields)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    pub fn db_error(error: impl Into<DbErr>) -> Self {
        ServiceError::DatabaseError(error.into())
    }

    /// Single field validation failure.
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(field.to_string(), vec![message.into()]);
        ServiceError::Validation(fields)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) | Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::CardTypeAlreadyExists => StatusCode::CONFLICT,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::AccessDenied(_) => StatusCode::FORBIDDEN,
            Self::Upstream { status, .. } => *status,
            Self::CircuitBreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable(_)
            | Self::DatabaseError(_)
            | Self::QueueError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine readable code carried in the response body.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(kind) => kind.not_found_code(),
            Self::Validation(_) | Self::InvalidInput(_) => "VALIDATION_ERROR",
            Self::CardTypeAlreadyExists => "CARD_TYPE_ALREADY_EXISTS",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::Upstream { .. } | Self::UpstreamUnavailable(_) | Self::CircuitBreakerOpen => {
                "INTERNAL_SERVICE_ERROR"
            }
            Self::DatabaseError(_)
            | Self::QueueError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "SERVER_ERROR",
        }
    }

    /// Detail safe to return to callers; internal failures carry none.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::NotFound(_)
            | Self::InvalidInput(_)
            | Self::CardTypeAlreadyExists
            | Self::AuthenticationFailed(_)
            | Self::AccessDenied(_) => Some(self.to_string()),
            Self::CircuitBreakerOpen => Some("Service temporarily unavailable".to_string()),
            _ => None,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            timestamp: chrono::Utc::now().to_rfc3339(),
            error_code: self.error_code().to_string(),
            detail: self.detail(),
            field_errors: match self {
                Self::Validation(fields) => Some(fields.clone()),
                _ => None,
            },
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            let request_id = crate::tracing::current_request_id();
            error!(
                request_id = request_id.as_ref().map(|r| r.as_str()).unwrap_or("-"),
                error = %self,
                "request failed"
            );
        }

        // A sibling's JSON error body is passed through untouched.
        if let Self::Upstream {
            body: Some(body @ Value::Object(_)),
            ..
        } = &self
        {
            return (status, Json(body.clone())).into_response();
        }

        (status, Json(self.to_error_response())).into_response()
    }
}

pub type AppError = ServiceError;

fn camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper = false;
    for c in field.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
