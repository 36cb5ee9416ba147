use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use strum::Display;
use tracing::{info, instrument, warn};

use crate::config::PaymentGatewayConfig;
use crate::errors::CheckoutError;
use crate::services::draft::round_money;

/// Gateway-side payment status.
///
/// Transitions only through explicit status checks; UI navigation events are
/// triggers to check, never a source of status themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Created,
    Open,
    Pending,
    Paid,
    Failed,
    Cancelled,
    Unknown,
}

/// Maps a remote status string onto [`PaymentStatus`], case-insensitively.
/// Anything unrecognized is `Unknown`, never an error: the verification loop
/// decides what to do with it.
pub fn map_remote_status(raw: &str) -> PaymentStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "paid" | "captured" => PaymentStatus::Paid,
        "open" | "pending" => PaymentStatus::Pending,
        "cancelled" | "canceled" | "failed" => PaymentStatus::Failed,
        _ => PaymentStatus::Unknown,
    }
}

/// A created gateway session: where to send the user, and how to find the
/// payment again afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub reference_id: String,
    pub amount: Decimal,
    pub checkout_url: String,
    /// Session token for gateways that take a form post instead of a plain
    /// redirect.
    pub session_token: Option<String>,
    pub status: PaymentStatus,
}

/// Key used to look a payment up on the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusQuery {
    /// Gateway-side transaction id, usually recovered from the return URL.
    OrderId(String),
    /// Our own reference id from the order draft.
    ReferenceId(String),
}

impl StatusQuery {
    fn as_query_pair(&self) -> (&'static str, &str) {
        match self {
            StatusQuery::OrderId(id) => ("orderId", id),
            StatusQuery::ReferenceId(id) => ("referenceId", id),
        }
    }

    pub fn value(&self) -> &str {
        self.as_query_pair().1
    }
}

/// Remote payment backend: session creation and status polling.
///
/// Implementations never retry; the retry policy belongs to the checkout
/// orchestrator.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(
        &self,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<PaymentSession, CheckoutError>;

    async fn poll_status(&self, query: &StatusQuery) -> Result<PaymentStatus, CheckoutError>;

    /// Auto-submitting form markup for gateways that take a token post
    /// instead of a plain redirect; `None` when the session has no token.
    fn payment_form_html(&self, _session: &PaymentSession) -> Option<String> {
        None
    }
}

/// HTTP client for the hosted-checkout payment backend.
pub struct HostedCheckoutClient {
    client: Client,
    base_url: String,
    create_session_path: String,
    status_path: String,
    payment_page_url: String,
}

impl HostedCheckoutClient {
    /// Build a client with the configured timeout.
    pub fn new(config: &PaymentGatewayConfig) -> Result<Self, CheckoutError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CheckoutError::Configuration(e.to_string()))?;
        Ok(Self::with_client(config, client))
    }

    /// Build from an existing client (useful for testing).
    pub fn with_client(config: &PaymentGatewayConfig, client: Client) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            create_session_path: config.create_session_path.clone(),
            status_path: config.status_path.clone(),
            payment_page_url: config.payment_page_url.clone(),
        }
    }
}

/// Auto-submitting form markup for the web runtime, where the session token
/// must be POSTed to the hosted payment page rather than opened by URL.
fn render_payment_form(payment_page_url: &str, session_token: &str) -> String {
    format!(
        concat!(
            "<!DOCTYPE html>\n<html>\n",
            "<body onload=\"document.forms[0].submit()\">\n",
            "  <form method=\"post\" action=\"{page}\">\n",
            "    <input type=\"hidden\" name=\"token\" value=\"{token}\" />\n",
            "    <p>Redirecting to the payment page...</p>\n",
            "  </form>\n</body>\n</html>\n"
        ),
        page = payment_page_url,
        token = session_token,
    )
}

/// Probes the accepted checkout URL fields in fixed priority order:
/// `checkoutPageUrl`, `checkoutUrl`, `href`, then nested `raw.href`.
fn extract_checkout_url(body: &Value) -> Option<String> {
    const TOP_LEVEL: [&str; 3] = ["checkoutPageUrl", "checkoutUrl", "href"];
    for field in TOP_LEVEL {
        if let Some(url) = body.get(field).and_then(Value::as_str) {
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    body.get("raw")
        .and_then(|raw| raw.get("href"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl PaymentGateway for HostedCheckoutClient {
    #[instrument(skip(self))]
    async fn create_session(
        &self,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<PaymentSession, CheckoutError> {
        let amount = round_money(amount);
        let url = format!("{}{}", self.base_url, self.create_session_path);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "amount": amount.to_f64(),
                "referenceId": reference_id,
            }))
            .send()
            .await
            .map_err(|e| CheckoutError::gateway_transport(&e))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| CheckoutError::gateway_transport(&e))?;

        if !status.is_success() {
            warn!(
                http_status = status.as_u16(),
                reference_id, "session creation refused"
            );
            return Err(CheckoutError::gateway_http(status.as_u16(), body_text));
        }

        let body: Value = serde_json::from_str(&body_text)
            .map_err(|e| CheckoutError::MalformedResponse(e.to_string()))?;

        let checkout_url = extract_checkout_url(&body).ok_or(CheckoutError::MissingCheckoutUrl)?;
        let session_token = body
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string);

        info!(reference_id, %amount, "payment session created");

        Ok(PaymentSession {
            reference_id: reference_id.to_string(),
            amount,
            checkout_url,
            session_token,
            status: PaymentStatus::Created,
        })
    }

    #[instrument(skip(self))]
    async fn poll_status(&self, query: &StatusQuery) -> Result<PaymentStatus, CheckoutError> {
        let url = format!("{}{}", self.base_url, self.status_path);

        let response = self
            .client
            .get(&url)
            .query(&[query.as_query_pair()])
            .send()
            .await
            .map_err(|e| CheckoutError::gateway_transport(&e))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| CheckoutError::gateway_transport(&e))?;

        if !status.is_success() {
            return Err(CheckoutError::gateway_http(status.as_u16(), body_text));
        }

        let body: Value = serde_json::from_str(&body_text)
            .map_err(|e| CheckoutError::MalformedResponse(e.to_string()))?;

        let raw_status = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CheckoutError::MalformedResponse("status field missing from response".to_string())
            })?;

        Ok(map_remote_status(raw_status))
    }

    fn payment_form_html(&self, session: &PaymentSession) -> Option<String> {
        session
            .session_token
            .as_deref()
            .map(|token| render_payment_form(&self.payment_page_url, token))
    }
}
