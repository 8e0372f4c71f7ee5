use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ethers::types::{H256, U256};
use thiserror::Error;

use crate::{ledger::LedgerError, lock::LockError, storage::StorageError};

/// How a caller should treat a failed authorization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the whole call later. Nothing was applied.
    Transient,
    /// The claim itself is unacceptable; only a new claim can succeed.
    ClaimInvalid,
    /// Internal fault. Never approves.
    Fatal,
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("lock on {key} not acquired after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("claimed amount {claimed} is not above already authorized amount {authorized}")]
    NegativeIncome { claimed: U256, authorized: U256 },
    #[error("claimed amount {claimed} exceeds channel deposit {deposit}")]
    InsufficientDeposit { claimed: U256, deposit: U256 },
    #[error("income {income} does not equal to price {price}")]
    PriceMismatch { income: U256, price: U256 },
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("payment channel {0:?} expired")]
    ChannelExpired(H256),
    #[error("payment channel {0:?} not found")]
    ChannelNotFound(H256),
    #[error("payment channel {0:?} belongs to another group")]
    GroupMismatch(H256),
    #[error("claim nonce {claimed} does not match channel nonce {current}")]
    NonceMismatch { claimed: U256, current: U256 },
    #[error("free call count {claimed} exceeds quota {quota}")]
    FreeCallQuotaExceeded { claimed: U256, quota: U256 },
    #[error("free calls are disabled")]
    FreeCallsDisabled,

    #[error("missing payment header {0}")]
    MissingHeader(&'static str),
    #[error("malformed payment header {header}: {reason}")]
    MalformedHeader { header: &'static str, reason: String },
    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),

    #[error("concurrent update of {0} persisted after retry")]
    ConcurrencyViolation(String),
    #[error("storage corrupted: {0}")]
    StorageCorruption(String),
}

impl ChannelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChannelError::LockTimeout { .. } | ChannelError::BackendUnavailable(_) => {
                ErrorClass::Transient
            }
            ChannelError::ConcurrencyViolation(_) | ChannelError::StorageCorruption(_) => {
                ErrorClass::Fatal
            }
            _ => ErrorClass::ClaimInvalid,
        }
    }

    /// Machine-readable reason code sent to the caller.
    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::LockTimeout { .. } => "lock_timeout",
            ChannelError::BackendUnavailable(_) => "backend_unavailable",
            ChannelError::NegativeIncome { .. } => "negative_income",
            ChannelError::InsufficientDeposit { .. } => "insufficient_deposit",
            ChannelError::PriceMismatch { .. } => "price_mismatch",
            ChannelError::InvalidSignature => "invalid_signature",
            ChannelError::ChannelExpired(_) => "channel_expired",
            ChannelError::ChannelNotFound(_) => "channel_not_found",
            ChannelError::GroupMismatch(_) => "group_mismatch",
            ChannelError::NonceMismatch { .. } => "nonce_mismatch",
            ChannelError::FreeCallQuotaExceeded { .. } => "free_call_quota_exceeded",
            ChannelError::FreeCallsDisabled => "free_calls_disabled",
            ChannelError::MissingHeader(_) => "missing_payment",
            ChannelError::MalformedHeader { .. } => "malformed_payment",
            ChannelError::InvalidChannelId(_) => "invalid_channel_id",
            ChannelError::ConcurrencyViolation(_) => "concurrency_violation",
            ChannelError::StorageCorruption(_) => "storage_corruption",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChannelError::LockTimeout { .. } | ChannelError::BackendUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChannelError::InvalidSignature
            | ChannelError::NegativeIncome { .. }
            | ChannelError::PriceMismatch { .. }
            | ChannelError::NonceMismatch { .. }
            | ChannelError::MissingHeader(_) => StatusCode::UNAUTHORIZED,
            ChannelError::InsufficientDeposit { .. } => StatusCode::PAYMENT_REQUIRED,
            ChannelError::ChannelExpired(_)
            | ChannelError::ChannelNotFound(_)
            | ChannelError::GroupMismatch(_)
            | ChannelError::FreeCallQuotaExceeded { .. }
            | ChannelError::FreeCallsDisabled => StatusCode::FORBIDDEN,
            ChannelError::MalformedHeader { .. } | ChannelError::InvalidChannelId(_) => {
                StatusCode::BAD_REQUEST
            }
            ChannelError::ConcurrencyViolation(_) | ChannelError::StorageCorruption(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StorageError> for ChannelError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Unavailable(msg) => ChannelError::BackendUnavailable(msg),
            corrupt @ StorageError::Corrupt { .. } => {
                ChannelError::StorageCorruption(corrupt.to_string())
            }
        }
    }
}

impl From<LockError> for ChannelError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Timeout { key, attempts } => ChannelError::LockTimeout { key, attempts },
            LockError::Storage(e) => e.into(),
        }
    }
}

impl From<LedgerError> for ChannelError {
    fn from(error: LedgerError) -> Self {
        ChannelError::BackendUnavailable(error.to_string())
    }
}

impl IntoResponse for ChannelError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self.class() {
            ErrorClass::Fatal => {
                tracing::error!(error = %self, "internal payment error");
                "An internal error occurred".to_string()
            }
            _ => self.to_string(),
        };
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": message,
        }));
        let mut response = (status, body).into_response();
        if self.class() == ErrorClass::Transient {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            ChannelError::BackendUnavailable("down".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(ChannelError::InvalidSignature.class(), ErrorClass::ClaimInvalid);
        assert_eq!(
            ChannelError::ConcurrencyViolation("k".into()).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_transient_response_has_retry_after() {
        let response = ChannelError::LockTimeout {
            key: "k".into(),
            attempts: 3,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[test]
    fn test_price_mismatch_message_names_both_values() {
        let error = ChannelError::PriceMismatch {
            income: U256::from(7),
            price: U256::from(10),
        };
        assert_eq!(error.to_string(), "income 7 does not equal to price 10");
        assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_storage_corruption_is_fatal() {
        let error: ChannelError = StorageError::Corrupt {
            key: "channel/1".into(),
            reason: "eof".into(),
        }
        .into();
        assert_eq!(error.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_replay_message_reads_correctly() {
        let error = ChannelError::NegativeIncome {
            claimed: U256::from(10),
            authorized: U256::from(10),
        };
        assert_eq!(
            error.to_string(),
            "claimed amount 10 is not above already authorized amount 10"
        );
    }
}
