use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use strum::Display;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::auth::{SessionProvider, UserId};
use crate::config::AppConfig;
use crate::errors::CheckoutError;
use crate::events::{Event, EventSender};
use crate::retry::{with_retry, AlwaysRetry, RetryConfig};
use crate::services::cart::CartStore;
use crate::services::draft::{OrderDraft, OrderDraftBuilder};
use crate::services::payment_gateway::{PaymentGateway, PaymentSession, PaymentStatus, StatusQuery};
use crate::services::pending_order::{MarkerState, PendingOrderMarker, PendingOrderStore};
use crate::services::persistence::{OrderPersistenceGateway, PersistedOrderResult};

/// Checkout flow state.
///
/// `Failed`, `Cancelled` and `Done` are terminal; a new checkout started
/// from any of them resets the flow. Every other state refuses a second
/// checkout invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutState {
    #[default]
    Idle,
    Confirming,
    CreatingSession,
    AwaitingExternalPayment,
    Verifying,
    Persisting,
    Done,
    Failed,
    Cancelled,
}

impl CheckoutState {
    fn accepts_new_checkout(self) -> bool {
        matches!(
            self,
            CheckoutState::Idle
                | CheckoutState::Done
                | CheckoutState::Failed
                | CheckoutState::Cancelled
        )
    }
}

/// Query parameters recovered from the gateway's return URL.
///
/// Every field is optional: partial or missing parameters are legal and fall
/// back to polling by reference id. Nothing here is ever treated as proof of
/// payment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReturnParams {
    pub order_number: Option<String>,
    pub points_earned: Option<i64>,
    pub total: Option<Decimal>,
    pub trans_id: Option<String>,
    pub reference_id: Option<String>,
}

fn non_empty(value: std::borrow::Cow<'_, str>) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl ReturnParams {
    /// Parses a return URL defensively. Unparseable URLs or values yield an
    /// empty parameter set, never an error.
    pub fn parse(url: &str) -> Self {
        let query = match Url::parse(url) {
            Ok(parsed) => parsed.query().map(str::to_string),
            Err(_) => url.split_once('?').map(|(_, q)| q.to_string()),
        };

        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "orderNumber" => params.order_number = non_empty(value),
                "pointsEarned" => params.points_earned = value.trim().parse().ok(),
                "total" => params.total = value.trim().parse().ok(),
                "transId" => params.trans_id = non_empty(value),
                "referenceId" => params.reference_id = non_empty(value),
                _ => {}
            }
        }
        params
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Where to send the user for the external payment step.
#[derive(Debug, Clone)]
pub struct PaymentRedirect {
    pub reference_id: String,
    pub checkout_url: String,
    /// Auto-submitting form markup when the gateway takes a token post
    /// instead of a plain redirect (web runtime).
    pub form_html: Option<String>,
}

/// Terminal result of a verification pass.
#[derive(Debug)]
pub enum CheckoutOutcome {
    /// Payment confirmed and the order recorded; `warnings` on the result
    /// list ancillary steps that did not complete.
    Completed(PersistedOrderResult),
    /// The gateway reported a terminal failure for this payment.
    Declined { reference_id: String },
}

#[derive(Debug, Default)]
struct ActiveFlow {
    state: CheckoutState,
    user_id: Option<UserId>,
    draft: Option<OrderDraft>,
    session: Option<PaymentSession>,
}

/// Reasons a status poll gets another attempt.
#[derive(Debug)]
enum PollAgain {
    Status(PaymentStatus),
    Gateway(CheckoutError),
}

impl fmt::Display for PollAgain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollAgain::Status(status) => write!(f, "payment status still {}", status),
            PollAgain::Gateway(err) => write!(f, "status check failed: {}", err),
        }
    }
}

/// Drives the end-to-end checkout flow.
///
/// One checkout is in flight at a time; all inputs (user taps, deep links,
/// browser events) funnel through this state machine, and every remote
/// failure is mapped to a [`CheckoutError`] before it reaches the host UI.
pub struct CheckoutOrchestrator {
    config: Arc<AppConfig>,
    cart: Arc<CartStore>,
    drafts: OrderDraftBuilder,
    gateway: Arc<dyn PaymentGateway>,
    persistence: OrderPersistenceGateway,
    pending: PendingOrderStore,
    session: Arc<dyn SessionProvider>,
    events: EventSender,
    flow: Mutex<ActiveFlow>,
}

impl CheckoutOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        cart: Arc<CartStore>,
        gateway: Arc<dyn PaymentGateway>,
        persistence: OrderPersistenceGateway,
        pending: PendingOrderStore,
        session: Arc<dyn SessionProvider>,
        events: EventSender,
    ) -> Self {
        let drafts = OrderDraftBuilder::from_config(&config.order);
        Self {
            config,
            cart,
            drafts,
            gateway,
            persistence,
            pending,
            session,
            events,
            flow: Mutex::new(ActiveFlow::default()),
        }
    }

    pub fn state(&self) -> CheckoutState {
        self.flow.lock().expect("checkout state lock poisoned").state
    }

    /// The externally observable proxy for "not idle": the UI disables
    /// checkout actions while this is true.
    pub fn is_processing_payment(&self) -> bool {
        !self.state().accepts_new_checkout()
    }

    /// The payment session of the flow in progress, if one has been created.
    /// Lets the host re-render the redirect after a view reload.
    pub fn active_session(&self) -> Option<PaymentSession> {
        self.flow
            .lock()
            .expect("checkout state lock poisoned")
            .session
            .clone()
    }

    /// User tapped checkout. Requires a signed-in user and a non-empty cart;
    /// a flow already past this point refuses re-entry instead of spawning a
    /// second session.
    #[instrument(skip(self))]
    pub async fn start_checkout(&self) -> Result<(), CheckoutError> {
        let user_id = {
            let mut flow = self.flow.lock().expect("checkout state lock poisoned");
            if !flow.state.accepts_new_checkout() {
                return Err(CheckoutError::CheckoutAlreadyInProgress(
                    flow.state.to_string(),
                ));
            }

            let Some(user_id) = self.session.current_user() else {
                return Err(CheckoutError::AuthenticationRequired(
                    "no signed-in user".to_string(),
                ));
            };
            if self.cart.is_empty() {
                return Err(CheckoutError::EmptyCart);
            }

            *flow = ActiveFlow {
                state: CheckoutState::Confirming,
                user_id: Some(user_id),
                ..ActiveFlow::default()
            };
            user_id
        };

        self.events
            .send_or_log(Event::CheckoutStarted { user_id })
            .await;
        Ok(())
    }

    /// User declined the confirmation prompt.
    pub async fn decline(&self) -> Result<(), CheckoutError> {
        {
            let mut flow = self.flow.lock().expect("checkout state lock poisoned");
            if flow.state != CheckoutState::Confirming {
                return Err(CheckoutError::InvalidOperation(format!(
                    "cannot decline from {}",
                    flow.state
                )));
            }
            flow.state = CheckoutState::Cancelled;
        }
        self.events
            .send_or_log(Event::CheckoutCancelled { reference_id: None })
            .await;
        info!("checkout declined at confirmation");
        Ok(())
    }

    /// User confirmed. Purges any prior pending-order marker, freezes the
    /// cart into a draft, and creates the gateway session.
    #[instrument(skip(self))]
    pub async fn confirm(&self) -> Result<PaymentRedirect, CheckoutError> {
        {
            let flow = self.flow.lock().expect("checkout state lock poisoned");
            if flow.state != CheckoutState::Confirming {
                return Err(CheckoutError::InvalidOperation(format!(
                    "cannot confirm from {}",
                    flow.state
                )));
            }
        }

        // A new checkout always invalidates a prior pending order, even an
        // unexpired one.
        match self.pending.purge().await {
            Ok(Some(order_number)) => {
                info!(%order_number, "prior pending order marker purged");
                self.events
                    .send_or_log(Event::PendingOrderPurged { order_number })
                    .await;
            }
            Ok(None) => {}
            Err(err) => {
                // A marker left behind only affects the countdown view;
                // checkout proceeds.
                warn!(error = %err, "could not purge pending order marker");
            }
        }

        let draft = match self.drafts.build(&self.cart.lines()) {
            Ok(draft) => draft,
            Err(err) => {
                // Cart emptied between start and confirm: back to idle, the
                // user sees the inline prompt.
                let mut flow = self.flow.lock().expect("checkout state lock poisoned");
                *flow = ActiveFlow::default();
                return Err(err);
            }
        };

        {
            let mut flow = self.flow.lock().expect("checkout state lock poisoned");
            flow.state = CheckoutState::CreatingSession;
            flow.draft = Some(draft.clone());
        }

        let amount = draft.rounded_total();
        match self.gateway.create_session(amount, &draft.reference_id).await {
            Ok(session) => {
                let form_html = self.gateway.payment_form_html(&session);
                let checkout_url = session.checkout_url.clone();
                {
                    let mut flow = self.flow.lock().expect("checkout state lock poisoned");
                    flow.state = CheckoutState::AwaitingExternalPayment;
                    flow.session = Some(session);
                }
                self.events
                    .send_or_log(Event::PaymentSessionCreated {
                        reference_id: draft.reference_id.clone(),
                        amount,
                    })
                    .await;
                Ok(PaymentRedirect {
                    reference_id: draft.reference_id,
                    checkout_url,
                    form_html,
                })
            }
            Err(err) => {
                error!(
                    reference_id = %draft.reference_id,
                    %amount,
                    error = %err,
                    "payment session creation failed"
                );
                self.fail(Some(draft.reference_id), &err).await;
                Err(err)
            }
        }
    }

    /// Return-URL callback from the external payment page. The parameters
    /// only seed the status query; the outcome still comes from polling.
    #[instrument(skip(self, url))]
    pub async fn on_return_url(&self, url: &str) -> Result<CheckoutOutcome, CheckoutError> {
        let params = ReturnParams::parse(url);
        debug!(?params, "return url received");
        self.verify_and_complete(Some(params)).await
    }

    /// The embedded browser was dismissed without an explicit outcome. A
    /// dismissal is a trigger to verify, not a cancellation.
    pub async fn on_browser_dismissed(&self) -> Result<CheckoutOutcome, CheckoutError> {
        self.verify_and_complete(None).await
    }

    /// The embedded browser reported an explicit user cancel.
    pub async fn on_browser_cancelled(&self) -> Result<(), CheckoutError> {
        let reference_id = {
            let mut flow = self.flow.lock().expect("checkout state lock poisoned");
            if flow.state != CheckoutState::AwaitingExternalPayment {
                return Err(CheckoutError::InvalidOperation(format!(
                    "cannot cancel from {}",
                    flow.state
                )));
            }
            flow.state = CheckoutState::Cancelled;
            flow.draft.as_ref().map(|d| d.reference_id.clone())
        };
        info!(?reference_id, "payment cancelled by user");
        self.events
            .send_or_log(Event::CheckoutCancelled { reference_id })
            .await;
        Ok(())
    }

    /// Reloads the pending-order marker on app start, purging it when the
    /// 15-minute window has lapsed.
    pub async fn resume_pending_order(
        &self,
    ) -> Result<Option<PendingOrderMarker>, CheckoutError> {
        match self.pending.load().await? {
            MarkerState::Active(marker) => Ok(Some(marker)),
            MarkerState::Expired(marker) => {
                info!(order_number = %marker.order_number, "pending order expired");
                self.events
                    .send_or_log(Event::PendingOrderExpired {
                        order_number: marker.order_number,
                    })
                    .await;
                Ok(None)
            }
            MarkerState::Absent => Ok(None),
        }
    }

    async fn verify_and_complete(
        &self,
        hint: Option<ReturnParams>,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        let (draft, user_id) = {
            let mut flow = self.flow.lock().expect("checkout state lock poisoned");
            if flow.state != CheckoutState::AwaitingExternalPayment {
                return Err(CheckoutError::InvalidOperation(format!(
                    "verification cannot start from {}",
                    flow.state
                )));
            }
            let (Some(draft), Some(user_id)) = (flow.draft.clone(), flow.user_id) else {
                return Err(CheckoutError::InvalidOperation(
                    "no active draft to verify".to_string(),
                ));
            };
            flow.state = CheckoutState::Verifying;
            (draft, user_id)
        };

        self.events
            .send_or_log(Event::PaymentVerificationStarted {
                reference_id: draft.reference_id.clone(),
            })
            .await;

        // Give the gateway a moment to settle before the first poll.
        sleep(Duration::from_millis(self.config.gateway.settle_delay_ms)).await;

        let query = match hint.as_ref().and_then(|p| p.trans_id.clone()) {
            Some(trans_id) => StatusQuery::OrderId(trans_id),
            None => StatusQuery::ReferenceId(
                hint.as_ref()
                    .and_then(|p| p.reference_id.clone())
                    .unwrap_or_else(|| draft.reference_id.clone()),
            ),
        };

        let retry_config = RetryConfig {
            max_attempts: self.config.gateway.poll_max_attempts,
            initial_delay: Duration::from_millis(self.config.gateway.poll_initial_backoff_ms),
            max_delay: Duration::from_millis(self.config.gateway.poll_max_backoff_ms),
            backoff_factor: 2.0,
            overall_cap: Some(Duration::from_secs(self.config.gateway.poll_overall_cap_secs)),
        };

        let outcome = with_retry(&retry_config, AlwaysRetry, || {
            let query = query.clone();
            async move {
                match self.gateway.poll_status(&query).await {
                    Ok(PaymentStatus::Paid) => Ok(PaymentStatus::Paid),
                    Ok(PaymentStatus::Failed) => Ok(PaymentStatus::Failed),
                    Ok(status) => Err(PollAgain::Status(status)),
                    Err(err) => Err(PollAgain::Gateway(err)),
                }
            }
        })
        .await;

        match outcome.result {
            Ok(PaymentStatus::Paid) => {
                info!(reference_id = %draft.reference_id, "payment confirmed");
                self.events
                    .send_or_log(Event::PaymentConfirmed {
                        reference_id: draft.reference_id.clone(),
                    })
                    .await;
                self.persist(draft, user_id).await
            }
            Ok(_) => {
                let reference_id = draft.reference_id.clone();
                info!(%reference_id, "gateway reported payment failure");
                self.set_state(CheckoutState::Failed);
                self.events
                    .send_or_log(Event::PaymentDeclined {
                        reference_id: reference_id.clone(),
                    })
                    .await;
                Ok(CheckoutOutcome::Declined { reference_id })
            }
            Err(last) => {
                // The gateway may still be processing asynchronously; this
                // is not a hard failure to the user.
                let err = CheckoutError::AmbiguousOutcome {
                    reference_id: draft.reference_id.clone(),
                    attempts: outcome.attempts,
                };
                warn!(
                    reference_id = %draft.reference_id,
                    attempts = outcome.attempts,
                    last = %last,
                    "verification exhausted without definitive status"
                );
                self.set_state(CheckoutState::Failed);
                self.events
                    .send_or_log(Event::PaymentOutcomeAmbiguous {
                        reference_id: draft.reference_id.clone(),
                        attempts: outcome.attempts,
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn persist(
        &self,
        draft: OrderDraft,
        user_id: UserId,
    ) -> Result<CheckoutOutcome, CheckoutError> {
        self.set_state(CheckoutState::Persisting);

        match self.persistence.commit(&draft, user_id).await {
            Ok(mut result) => {
                // The cart is cleared only now that the order rows exist.
                self.cart.clear();

                if let Err(err) = self
                    .pending
                    .write(&result.order_number, result.points_earned)
                    .await
                {
                    warn!(error = %err, "pending order marker not written");
                    result
                        .warnings
                        .push(format!("pickup countdown unavailable: {}", err));
                }

                self.set_state(CheckoutState::Done);
                self.events
                    .send_or_log(Event::OrderPersisted {
                        order_number: result.order_number.clone(),
                        points_earned: result.points_earned,
                        total: result.total,
                    })
                    .await;
                if !result.warnings.is_empty() {
                    self.events
                        .send_or_log(Event::OrderPersistenceIncomplete {
                            order_number: result.order_number.clone(),
                            warnings: result.warnings.clone(),
                        })
                        .await;
                }
                Ok(CheckoutOutcome::Completed(result))
            }
            Err(err) => {
                // Money has moved without a guaranteed order record. The
                // cart is intentionally left intact so persistence alone can
                // be retried; the commit already logged the reconciliation
                // context.
                self.set_state(CheckoutState::Failed);
                self.events
                    .send_or_log(Event::CheckoutFailed {
                        reference_id: Some(draft.reference_id.clone()),
                        reason: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn fail(&self, reference_id: Option<String>, err: &CheckoutError) {
        self.set_state(CheckoutState::Failed);
        self.events
            .send_or_log(Event::CheckoutFailed {
                reference_id,
                reason: err.to_string(),
            })
            .await;
    }

    fn set_state(&self, state: CheckoutState) {
        let mut flow = self.flow.lock().expect("checkout state lock poisoned");
        debug!(from = %flow.state, to = %state, "checkout state transition");
        flow.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // ==================== Return URL Parsing ====================

    #[test]
    fn parses_full_return_url() {
        let params = ReturnParams::parse(
            "myapp://order-confirmation?orderNumber=ORD-20250101-1234&pointsEarned=21&total=21.20&transId=tx-9&referenceId=FD-1",
        );
        assert_eq!(params.order_number.as_deref(), Some("ORD-20250101-1234"));
        assert_eq!(params.points_earned, Some(21));
        assert_eq!(params.total, Some(dec!(21.20)));
        assert_eq!(params.trans_id.as_deref(), Some("tx-9"));
        assert_eq!(params.reference_id.as_deref(), Some("FD-1"));
    }

    #[test]
    fn partial_params_are_legal() {
        let params = ReturnParams::parse("myapp://order-confirmation?transId=tx-9");
        assert_eq!(params.trans_id.as_deref(), Some("tx-9"));
        assert!(params.order_number.is_none());
        assert!(params.total.is_none());
    }

    #[test]
    fn garbage_values_become_none() {
        let params = ReturnParams::parse(
            "myapp://order-confirmation?pointsEarned=lots&total=free&orderNumber=",
        );
        assert!(params.points_earned.is_none());
        assert!(params.total.is_none());
        assert!(params.order_number.is_none());
        assert!(params.is_empty());
    }

    #[test]
    fn bare_query_string_still_parses() {
        // Some webview stacks hand over only the path and query.
        let params = ReturnParams::parse("order-confirmation?orderNumber=ORD-1&pointsEarned=3");
        assert_eq!(params.order_number.as_deref(), Some("ORD-1"));
        assert_eq!(params.points_earned, Some(3));
    }

    #[test]
    fn url_without_query_is_empty() {
        assert!(ReturnParams::parse("myapp://order-confirmation").is_empty());
    }

    #[test]
    fn url_decoding_applies() {
        let params = ReturnParams::parse("myapp://x?orderNumber=ORD%2D20250101%2D0007");
        assert_eq!(params.order_number.as_deref(), Some("ORD-20250101-0007"));
    }

    // ==================== State Predicates ====================

    #[test]
    fn resumable_states_accept_new_checkout() {
        for state in [
            CheckoutState::Idle,
            CheckoutState::Done,
            CheckoutState::Failed,
            CheckoutState::Cancelled,
        ] {
            assert!(state.accepts_new_checkout(), "{state} should accept");
        }
        for state in [
            CheckoutState::Confirming,
            CheckoutState::CreatingSession,
            CheckoutState::AwaitingExternalPayment,
            CheckoutState::Verifying,
            CheckoutState::Persisting,
        ] {
            assert!(!state.accepts_new_checkout(), "{state} should refuse");
        }
    }

    #[test]
    fn state_names_render_screaming_snake() {
        assert_eq!(
            CheckoutState::AwaitingExternalPayment.to_string(),
            "AWAITING_EXTERNAL_PAYMENT"
        );
        assert_eq!(CheckoutState::CreatingSession.to_string(), "CREATING_SESSION");
    }
}
