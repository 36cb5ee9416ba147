use serde::Serialize;

use crate::storage::StorageError;

/// Error taxonomy for the checkout core.
///
/// Every component-level failure is mapped into one of these variants at the
/// orchestrator boundary; the host UI only ever sees a `CheckoutError` (or an
/// outcome value), never a raw transport error.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum CheckoutError {
    #[error("cart is empty")]
    EmptyCart,

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("checkout already in progress (state: {0})")]
    CheckoutAlreadyInProgress(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Network failure or non-2xx reply from the payment gateway. A missing
    /// `http_status` means the request never produced an HTTP response.
    #[error("payment gateway error (status {http_status:?}): {raw_body}")]
    PaymentGateway {
        http_status: Option<u16>,
        raw_body: String,
    },

    #[error("gateway response carried none of the accepted checkout URL fields")]
    MissingCheckoutUrl,

    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),

    /// The poll budget ran out without a definitive status. Money may have
    /// moved; the user is pointed at out-of-band confirmation, never shown a
    /// hard failure.
    #[error("payment outcome unknown for {reference_id} after {attempts} status checks")]
    AmbiguousOutcome { reference_id: String, attempts: u32 },

    /// Order persistence failed. When `payment_confirmed` is set this is the
    /// critical class: the charge went through but no order record exists, so
    /// the failure is logged with full reconciliation context.
    #[error("order persistence failed for {reference_id}: {message}")]
    Persistence {
        reference_id: String,
        message: String,
        payment_confirmed: bool,
    },

    #[error("storage error: {0}")]
    Storage(
        #[from]
        #[serde(skip)]
        StorageError,
    ),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CheckoutError {
    pub fn gateway_http(status: u16, body: impl Into<String>) -> Self {
        Self::PaymentGateway {
            http_status: Some(status),
            raw_body: body.into(),
        }
    }

    pub fn gateway_transport(err: &reqwest::Error) -> Self {
        Self::PaymentGateway {
            http_status: err.status().map(|s| s.as_u16()),
            raw_body: err.to_string(),
        }
    }

    pub fn persistence_after_payment(
        reference_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Persistence {
            reference_id: reference_id.into(),
            message: message.into(),
            payment_confirmed: true,
        }
    }

    /// True for errors the user can fix themselves (shown as inline prompts
    /// rather than retryable toasts).
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::EmptyCart | Self::AuthenticationRequired(_) | Self::CheckoutAlreadyInProgress(_)
        )
    }

    /// True when the failure happened after a confirmed charge and needs
    /// manual reconciliation against the gateway's records.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Persistence {
                payment_confirmed: true,
                ..
            }
        )
    }

    /// The message the host UI should surface for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyCart => "Your cart is empty.".to_string(),
            Self::AuthenticationRequired(_) => {
                "You must be logged in to place an order.".to_string()
            }
            Self::CheckoutAlreadyInProgress(_) => {
                "An order is already being processed.".to_string()
            }
            Self::InvalidOperation(_) => "That action is not available right now.".to_string(),
            Self::PaymentGateway { .. }
            | Self::MissingCheckoutUrl
            | Self::MalformedResponse(_) => {
                "We could not reach the payment provider. Please try again.".to_string()
            }
            Self::AmbiguousOutcome { .. } => {
                "Your payment is still being processed. Check your email for confirmation."
                    .to_string()
            }
            Self::Persistence {
                payment_confirmed: true,
                ..
            } => "Your payment was received and your order is being processed.".to_string(),
            Self::Persistence { .. } => {
                "We could not record your order. Please try again.".to_string()
            }
            Self::Storage(_) | Self::Configuration(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_http_carries_status_and_body() {
        let err = CheckoutError::gateway_http(502, "bad gateway");
        match err {
            CheckoutError::PaymentGateway {
                http_status,
                raw_body,
            } => {
                assert_eq!(http_status, Some(502));
                assert_eq!(raw_body, "bad gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn post_payment_persistence_is_critical() {
        let err = CheckoutError::persistence_after_payment("FD-1", "insert refused");
        assert!(err.is_critical());
        assert!(!err.is_user_correctable());
        // The user sees a soft processing message, never a bare failure.
        assert!(err.user_message().contains("being processed"));
    }

    #[test]
    fn user_correctable_errors_are_prompts() {
        assert!(CheckoutError::EmptyCart.is_user_correctable());
        assert!(CheckoutError::AuthenticationRequired("no session".into()).is_user_correctable());
        assert!(!CheckoutError::MissingCheckoutUrl.is_user_correctable());
    }

    #[test]
    fn ambiguous_outcome_points_at_email() {
        let err = CheckoutError::AmbiguousOutcome {
            reference_id: "ORD-20250101-1234".into(),
            attempts: 5,
        };
        assert!(err.user_message().contains("email"));
    }
}
