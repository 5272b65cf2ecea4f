//! Error types for credit-gated admission and reconciliation.
//!
//! [`GateError`] is the single error type surfaced by the
//! [`AdmissionEngine`](crate::engine::AdmissionEngine). Business-rule failures
//! (`Unauthorized`, `Forbidden`, `InsufficientCredits`, `NotFound`) carry a
//! precise, user-actionable message. Infrastructure failures
//! (`Internal`, gateway errors) keep their diagnostic detail for logs but
//! expose only a generic [`public_message`](GateError::public_message).

use http::StatusCode;
use thiserror::Error;

use crate::history::HistoryError;
use crate::ledger::LedgerError;
use crate::store::backend::StorageError;
use crate::types::{TaskHandle, UserId};

/// Errors surfaced by the admission engine.
///
/// Use [`status_code`](GateError::status_code) to map to the transport's
/// response status and [`is_retryable`](GateError::is_retryable) to decide
/// whether the caller may retry the same request unchanged.
///
/// # Examples
///
/// ```
/// use credit_gate::error::GateError;
/// use credit_gate::types::UserId;
/// use http::StatusCode;
///
/// let err = GateError::InsufficientCredits {
///     user: UserId::new("test_user"),
///     cost: 10,
/// };
/// assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
/// assert_eq!(err.public_message(), "Insufficient credits");
/// ```
#[derive(Debug, Error)]
pub enum GateError {
    /// The credential does not belong to any user.
    #[error("unauthorized")]
    Unauthorized,

    /// The caller is authenticated but not allowed to perform the operation.
    #[error("forbidden: {reason}")]
    Forbidden {
        /// Human-readable reason, safe to show to the caller.
        reason: String,
    },

    /// The user's balance cannot cover the task cost. No ledger mutation
    /// happened.
    #[error("insufficient credits: user {user} cannot cover cost {cost}")]
    InsufficientCredits {
        /// The user that was charged.
        user: UserId,
        /// The cost that was rejected.
        cost: u64,
    },

    /// The target user does not exist.
    #[error("user not found: {user}")]
    NotFound {
        /// The missing user.
        user: UserId,
    },

    /// The capability has been switched off in configuration.
    #[error("capability disabled: {capability}")]
    ServiceUnavailable {
        /// Name of the disabled capability.
        capability: &'static str,
    },

    /// Dispatch to the task gateway failed or timed out.
    ///
    /// When `charged` is true the user's balance was already deducted and
    /// is **not** refunded; operators must reconcile manually.
    #[error("task dispatch failed for user {user} (charged: {charged}): {message}")]
    DispatchFailed {
        /// The submitting user.
        user: UserId,
        /// Whether credits were deducted before the failure.
        charged: bool,
        /// Whether the failure was a timeout.
        timed_out: bool,
        /// Diagnostic detail (never shown to callers).
        message: String,
    },

    /// The task was dispatched but its history record could not be written.
    ///
    /// When `charged` is true the eager deduction stands and is **not**
    /// refunded. When false (fair policy) the task runs unbilled, since no
    /// record exists to settle it against.
    #[error("task {handle} for user {user} not tracked (charged: {charged}): {message}")]
    TrackingFailed {
        /// The submitting user.
        user: UserId,
        /// The dispatched task.
        handle: TaskHandle,
        /// Whether credits were deducted at admission.
        charged: bool,
        /// Diagnostic detail (never shown to callers).
        message: String,
    },

    /// Polling the task gateway failed or timed out. Never mutates the
    /// ledger; safe to retry.
    #[error("task poll failed for {handle}: {message}")]
    PollFailed {
        /// The polled task.
        handle: TaskHandle,
        /// Whether the failure was a timeout.
        timed_out: bool,
        /// Diagnostic detail (never shown to callers).
        message: String,
    },

    /// Ledger, history, or identity store failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Maps this error to the status a transport layer should return.
    ///
    /// ```
    /// use credit_gate::error::GateError;
    /// use http::StatusCode;
    ///
    /// assert_eq!(GateError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
    /// assert_eq!(
    ///     GateError::Internal("db down".to_string()).status_code(),
    ///     StatusCode::INTERNAL_SERVER_ERROR
    /// );
    /// ```
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } | Self::InsufficientCredits { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DispatchFailed {
                timed_out: true, ..
            }
            | Self::PollFailed {
                timed_out: true, ..
            } => StatusCode::GATEWAY_TIMEOUT,
            Self::DispatchFailed { .. } | Self::PollFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::TrackingFailed { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the message a caller may see.
    ///
    /// Infrastructure failures collapse to a generic message so internal
    /// diagnostics never leak.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthorized => "Unauthorized".to_string(),
            Self::Forbidden { reason } => reason.clone(),
            Self::InsufficientCredits { .. } => "Insufficient credits".to_string(),
            Self::NotFound { .. } => "User not found.".to_string(),
            Self::ServiceUnavailable { .. } => "Service temporarily unavailable".to_string(),
            Self::DispatchFailed { .. } | Self::TrackingFailed { .. } => {
                "Task could not be dispatched".to_string()
            },
            Self::PollFailed { .. } => "Task state is temporarily unavailable".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Returns `true` if repeating the request unchanged may succeed.
    ///
    /// Submissions that already charged the user are not retryable: a retry
    /// would charge again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PollFailed { .. } | Self::Internal(_) => true,
            Self::DispatchFailed { charged, .. } => !charged,
            _ => false,
        }
    }

    /// Returns `true` for partial failures where credits were deducted but
    /// the task was not both dispatched and tracked.
    pub fn is_partial_failure(&self) -> bool {
        matches!(
            self,
            Self::DispatchFailed { charged: true, .. } | Self::TrackingFailed { charged: true, .. }
        )
    }
}

impl From<StorageError> for GateError {
    fn from(err: StorageError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<LedgerError> for GateError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                user, requested, ..
            } => Self::InsufficientCredits {
                user,
                cost: requested,
            },
            LedgerError::NotFound { user } => Self::NotFound { user },
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<HistoryError> for GateError {
    fn from(err: HistoryError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(charged: bool, timed_out: bool) -> GateError {
        GateError::DispatchFailed {
            user: UserId::new("u"),
            charged,
            timed_out,
            message: "broker unreachable".to_string(),
        }
    }

    #[test]
    fn status_codes() {
        assert_eq!(GateError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GateError::NotFound {
                user: UserId::new("ghost")
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GateError::ServiceUnavailable { capability: "submit" }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(dispatch(true, true).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(dispatch(true, false).status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_detail_is_not_public() {
        let err = GateError::Internal("connection refused at 10.0.0.7:5432".to_string());
        assert!(err.to_string().contains("10.0.0.7"));
        assert!(!err.public_message().contains("10.0.0.7"));

        let err = dispatch(true, false);
        assert!(!err.public_message().contains("broker"));
    }

    #[test]
    fn charged_dispatch_failures_are_partial_and_not_retryable() {
        assert!(dispatch(true, false).is_partial_failure());
        assert!(!dispatch(true, false).is_retryable());
        assert!(!dispatch(false, false).is_partial_failure());
        assert!(dispatch(false, true).is_retryable());
    }

    #[test]
    fn storage_errors_become_internal() {
        let err: GateError = StorageError::Backend {
            message: "timeout".to_string(),
            source: None,
        }
        .into();
        assert!(matches!(err, GateError::Internal(ref m) if m.contains("timeout")));
    }

    #[test]
    fn ledger_business_errors_keep_their_kind() {
        let err: GateError = LedgerError::InsufficientCredits {
            user: UserId::new("u"),
            balance: 3,
            requested: 10,
        }
        .into();
        assert!(matches!(err, GateError::InsufficientCredits { cost: 10, .. }));

        let err: GateError = LedgerError::NotFound {
            user: UserId::new("ghost"),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: GateError = LedgerError::Contention {
            user: UserId::new("u"),
            attempts: 64,
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
