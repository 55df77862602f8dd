use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Unprocessable Entity",
    "code": "MIN_ORDER_NOT_MET",
    "message": "Order subtotal must be at least 500000 (add 100000 more)",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Stable machine-readable code; clients dispatch on this, never on `message`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

/// Business-rule rejections produced while evaluating or redeeming a coupon.
///
/// Each variant owns a stable code (see [`CouponRejection::code`]). The
/// message is for display only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, strum::IntoStaticStr)]
pub enum CouponRejection {
    #[strum(serialize = "COUPON_NOT_FOUND")]
    #[error("Coupon {code} does not exist")]
    NotFound { code: String },

    #[strum(serialize = "COUPON_INACTIVE")]
    #[error("Coupon is no longer active")]
    Inactive,

    #[strum(serialize = "COUPON_EXPIRED")]
    #[error("{}", expired_message(.before_start))]
    Expired { before_start: bool },

    #[strum(serialize = "COUPON_USAGE_LIMIT_REACHED")]
    #[error("Coupon has been fully redeemed")]
    UsageLimitReached,

    #[strum(serialize = "AUTH_REQUIRED_FOR_PRIVATE_COUPON")]
    #[error("Please sign in to use this coupon")]
    AuthRequired,

    #[strum(serialize = "COUPON_NOT_AVAILABLE_FOR_USER")]
    #[error("Coupon is not available for this account")]
    NotAvailableForUser,

    #[strum(serialize = "USER_USAGE_LIMIT_REACHED")]
    #[error("You have already used this coupon {limit} time(s)")]
    UserUsageLimitReached { limit: i32 },

    #[strum(serialize = "MIN_ORDER_NOT_MET")]
    #[error("Order subtotal must be at least {min_order_value} (add {shortfall} more)")]
    MinOrderNotMet {
        min_order_value: Decimal,
        shortfall: Decimal,
    },

    #[strum(serialize = "COUPON_SCOPE_MISMATCH")]
    #[error("No item in the cart is eligible for this coupon")]
    ScopeMismatch,
}

fn expired_message(before_start: &bool) -> &'static str {
    if *before_start {
        "Coupon is not valid yet"
    } else {
        "Coupon has expired"
    }
}

impl CouponRejection {
    pub fn code(&self) -> &'static str {
        self.into()
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::UsageLimitReached => StatusCode::CONFLICT,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    CouponRejected(#[from] CouponRejection),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::ExternalServiceError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidInput(_) | Self::InvalidOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::CouponRejected(rejection) => rejection.status_code(),
            Self::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CouponRejected(rejection) => rejection.code(),
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::PaymentFailed(_) => "PAYMENT_FAILED",
            Self::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            Self::CouponRejected(rejection) => rejection.to_string(),
            _ => self.to_string(),
        }
    }

    /// The coupon rejection behind this error, if any.
    pub fn as_rejection(&self) -> Option<&CouponRejection> {
        match self {
            Self::CouponRejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

pub(crate) fn error_body(status: StatusCode, code: Option<&str>, message: String) -> Response {
    let body = ErrorResponse {
        error: status.canonical_reason().unwrap_or("Error").to_string(),
        code: code.map(str::to_string),
        message,
        request_id: current_request_id(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (status, Json(body)).into_response()
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        error_body(status, Some(self.code()), self.response_message())
    }
}

/// API Error type for HTTP responses
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {message}")]
    BadRequest {
        message: String,
        error_code: Option<String>,
    },
}

impl From<CouponRejection> for ApiError {
    fn from(rejection: CouponRejection) -> Self {
        ApiError::ServiceError(rejection.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::ServiceError(service_error) => service_error.into_response(),
            ApiError::ValidationError(msg) => {
                error_body(StatusCode::BAD_REQUEST, Some("VALIDATION_ERROR"), msg)
            }
            ApiError::NotFound(msg) => error_body(StatusCode::NOT_FOUND, Some("NOT_FOUND"), msg),
            ApiError::Unauthorized => error_body(
                StatusCode::UNAUTHORIZED,
                Some("UNAUTHORIZED"),
                "Unauthorized".to_string(),
            ),
            ApiError::BadRequest {
                message,
                error_code,
            } => error_body(StatusCode::BAD_REQUEST, error_code.as_deref(), message),
        }
    }
}
