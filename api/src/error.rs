//! Error Handling Module
//!
//! Two layers:
//! - `PaymentError`: domain taxonomy used by services (chain, keys, storage).
//! - `ApiError`: HTTP-facing errors with proper status code mapping.
//!
//! Uses thiserror for domain errors and integrates with tracing for structured logging.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 결제 도메인 에러
///
/// # Design Decision
///
/// 에러 분류에 따라 호출자의 대응이 달라짐
/// - Configuration / InvalidXxx: 설정·입력 문제 → 재시도 무의미, 관리자에게 노출
/// - Chain: 일시적 RPC 장애 → backoff 재시도 (절대 "실패" 상태로 확정하지 않음)
/// - DerivedAddressMismatch: 보안 이벤트 → 해당 작업 즉시 중단
/// - InsufficientBalance / InsufficientGas: 해당 작업만 실패, 로컬 상태 변경 없음
///
/// 중복 입금, 부분 입금, 초과 입금은 에러가 아님 (결과 타입으로 표현)
#[derive(Debug, Error)]
pub enum PaymentError {
    // ============ Configuration ============
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid transaction hash: {0}")]
    InvalidTxHash(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    // ============ Key Derivation ============
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Derived address {derived} does not match stored address {expected}")]
    DerivedAddressMismatch { expected: String, derived: String },

    // ============ Chain ============
    #[error("Insufficient USDC balance: {available} available, {required} required")]
    InsufficientBalance { available: String, required: String },

    #[error("Insufficient gas: {available} wei available, {required} wei required")]
    InsufficientGas { available: String, required: String },

    #[error("Chain error: {0}")]
    Chain(String),

    // ============ Storage ============
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl PaymentError {
    /// 재시도로 해결될 수 있는 에러인지
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::Chain(_) | PaymentError::Storage(_))
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(err: sqlx::Error) -> Self {
        PaymentError::Storage(err.to_string())
    }
}

/// API 에러 타입
///
/// # Design Decision
///
/// 각 에러 variant는 적절한 HTTP 상태 코드에 매핑됨
/// - 클라이언트 에러: 4xx (잘못된 요청, 인증 실패 등)
/// - 서버 에러: 5xx (내부 오류)
///
/// 민감한 내부 정보는 클라이언트에 노출하지 않음
#[derive(Debug, Error)]
pub enum ApiError {
    // ============ 400 Bad Request ============
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Validation failed: {0}")]
    ValidationError(String),

    // ============ 401 Unauthorized ============
    #[error("Authentication required")]
    Unauthorized,

    // ============ 404 Not Found ============
    #[error("Resource not found: {0}")]
    NotFound(String),

    // ============ 422 Unprocessable Entity ============
    #[error("Operation rejected: {0}")]
    Rejected(String),

    // ============ 500 Internal Server Error ============
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal server error")]
    InternalError,

    // ============ 503 Service Unavailable ============
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// API 에러 응답 구조
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            // 4xx 클라이언트 에러
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            ApiError::ValidationError(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "Validation failed".to_string(),
                Some(msg.clone()),
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
                None,
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{} not found", resource),
                None,
            ),
            ApiError::Rejected(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "REJECTED",
                "Operation rejected".to_string(),
                Some(msg.clone()),
            ),

            // 5xx 서버 에러
            ApiError::DatabaseError(_) => {
                // 내부 에러는 클라이언트에 상세 정보 노출 안 함
                tracing::error!("Database error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Database error occurred".to_string(),
                    None,
                )
            }
            ApiError::InternalError => {
                tracing::error!("Internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            ApiError::ServiceUnavailable(service) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                format!("{} is currently unavailable", service),
                None,
            ),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// 도메인 에러를 HTTP 에러로 변환
///
/// 체인 에러 원문은 클라이언트에 노출하지 않음 (로그로만 남김)
impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidAddress(_)
            | PaymentError::InvalidTxHash(_)
            | PaymentError::InvalidAmount(_)
            | PaymentError::UnsupportedKeyType(_) => ApiError::ValidationError(err.to_string()),
            PaymentError::Configuration(msg) => ApiError::ServiceUnavailable(msg),
            PaymentError::NotFound(what) => ApiError::NotFound(what),
            PaymentError::InsufficientBalance { .. } | PaymentError::InsufficientGas { .. } => {
                ApiError::Rejected(err.to_string())
            }
            PaymentError::DerivedAddressMismatch { .. } | PaymentError::KeyDerivation(_) => {
                tracing::error!(target: "security", error = %err, "key verification failed");
                ApiError::InternalError
            }
            PaymentError::Chain(msg) => {
                tracing::error!("Chain error: {}", msg);
                ApiError::ServiceUnavailable("Blockchain RPC".to_string())
            }
            PaymentError::Storage(msg) => ApiError::DatabaseError(msg),
        }
    }
}

/// SQLx 에러를 ApiError로 변환
impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("SQLx error: {:?}", err);
        ApiError::DatabaseError(err.to_string())
    }
}

/// anyhow 에러를 ApiError로 변환
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Anyhow error: {:?}", err);
        ApiError::InternalError
    }
}
