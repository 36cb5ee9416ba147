use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::UserId;
use crate::config::DataServiceConfig;
use crate::errors::CheckoutError;
use crate::services::draft::{date_random_reference, round_money, OrderDraft};

/// Human-facing order numbers are always date-random, regardless of which
/// reference scheme the payment gateway uses.
const ORDER_NUMBER_PREFIX: &str = "ORD";

/// Order line as inserted into the hosted data store. Field names follow the
/// remote table contract.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRow {
    #[serde(rename = "userid")]
    pub user_id: Uuid,
    #[serde(rename = "productid")]
    pub product_id: Uuid,
    pub quantity: u32,
    /// Per-line price with tax, rounded to cents at write time.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(rename = "statusid")]
    pub status_id: i32,
    pub date: DateTime<Utc>,
    #[serde(rename = "ordernumber")]
    pub order_number: String,
    #[serde(rename = "referenceid")]
    pub reference_id: String,
}

/// Inserted order line as echoed back by the data store, carrying the
/// generated row id that extras rows hang off.
#[derive(Debug, Clone, Deserialize)]
pub struct InsertedOrderRow {
    pub id: i64,
    #[serde(rename = "productid")]
    pub product_id: Uuid,
}

/// Association row linking a selected extra to an inserted order line.
#[derive(Debug, Clone, Serialize)]
pub struct ExtraLink {
    pub order_id: i64,
    pub extra_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("data service returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("data service transport error: {0}")]
    Transport(String),
    #[error("data service response decode error: {0}")]
    Decode(String),
}

/// Remote data store operations used by the persistence gateway.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order_rows(
        &self,
        rows: &[OrderRow],
    ) -> Result<Vec<InsertedOrderRow>, StoreError>;

    async fn insert_extra_links(&self, links: &[ExtraLink]) -> Result<(), StoreError>;

    /// Current point balance; a missing balance row reads as 0.
    async fn fetch_points(&self, user_id: UserId) -> Result<i64, StoreError>;

    async fn update_points(&self, user_id: UserId, points: i64) -> Result<(), StoreError>;
}

/// HTTP client for the hosted data service.
pub struct HostedDataStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HostedDataStore {
    pub fn new(config: &DataServiceConfig) -> Result<Self, CheckoutError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CheckoutError::Configuration(e.to_string()))?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: &DataServiceConfig, client: Client) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !self.api_key.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.api_key) {
                headers.insert("apikey", value);
            }
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl OrderStore for HostedDataStore {
    async fn insert_order_rows(
        &self,
        rows: &[OrderRow],
    ) -> Result<Vec<InsertedOrderRow>, StoreError> {
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .headers(self.headers())
            .header("Prefer", "return=representation")
            .json(rows)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Self::check(response)
            .await?
            .json::<Vec<InsertedOrderRow>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn insert_extra_links(&self, links: &[ExtraLink]) -> Result<(), StoreError> {
        let response = self
            .client
            .post(format!("{}/order_extras", self.base_url))
            .headers(self.headers())
            .json(links)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    async fn fetch_points(&self, user_id: UserId) -> Result<i64, StoreError> {
        #[derive(Deserialize)]
        struct PointsRow {
            points: Option<i64>,
        }

        let response = self
            .client
            .get(format!("{}/users", self.base_url))
            .headers(self.headers())
            .query(&[("select", "points"), ("id", &format!("eq.{}", user_id))])
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let rows: Vec<PointsRow> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.points)
            .unwrap_or(0))
    }

    async fn update_points(&self, user_id: UserId, points: i64) -> Result<(), StoreError> {
        let response = self
            .client
            .patch(format!("{}/users", self.base_url))
            .headers(self.headers())
            .query(&[("id", format!("eq.{}", user_id))])
            .json(&serde_json::json!({ "points": points }))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }
}

/// Result of a committed order. `warnings` lists ancillary steps that
/// failed after the order rows themselves were written.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedOrderResult {
    pub order_number: String,
    pub reference_id: String,
    pub total: Decimal,
    pub points_earned: i64,
    pub warnings: Vec<String>,
}

/// Commits finalized orders to the remote data store.
///
/// The store exposes no multi-statement transaction, so the commit is a
/// best-effort sequence: order rows first, then extras associations, then
/// the loyalty-point read-modify-write. Failures after the first step are
/// reported as warnings on the result, not rolled back.
pub struct OrderPersistenceGateway {
    store: Arc<dyn OrderStore>,
}

impl OrderPersistenceGateway {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }

    /// Commits the draft for `user_id`. Call only after the payment outcome
    /// is confirmed PAID: a failure here therefore carries the critical
    /// `payment_confirmed` marker and enough context for manual
    /// reconciliation.
    #[instrument(skip(self, draft), fields(reference_id = %draft.reference_id))]
    pub async fn commit(
        &self,
        draft: &OrderDraft,
        user_id: UserId,
    ) -> Result<PersistedOrderResult, CheckoutError> {
        let order_number = date_random_reference(ORDER_NUMBER_PREFIX);
        let now = Utc::now();
        let tax_multiplier = Decimal::ONE + draft.tax_rate;

        let rows: Vec<OrderRow> = draft
            .lines
            .iter()
            .map(|line| OrderRow {
                user_id,
                product_id: line.product_id,
                quantity: line.quantity,
                price: round_money(line.line_total() * tax_multiplier),
                status_id: 1,
                date: now,
                order_number: order_number.clone(),
                reference_id: draft.reference_id.clone(),
            })
            .collect();

        // Step 1: order rows. The only step whose failure fails the commit.
        let inserted = self.store.insert_order_rows(&rows).await.map_err(|e| {
            error!(
                reference_id = %draft.reference_id,
                amount = %draft.rounded_total(),
                error = %e,
                "order rows could not be written after confirmed payment"
            );
            CheckoutError::persistence_after_payment(&draft.reference_id, e.to_string())
        })?;

        let mut warnings = Vec::new();

        // Step 2: extras associations, keyed by the generated line ids.
        // Inserted rows come back in insert order, matching the draft lines.
        let links: Vec<ExtraLink> = inserted
            .iter()
            .zip(draft.lines.iter())
            .flat_map(|(row, line)| {
                line.selected_extra_ids.iter().map(|extra_id| ExtraLink {
                    order_id: row.id,
                    extra_id: *extra_id,
                })
            })
            .collect();

        if !links.is_empty() {
            if let Err(e) = self.store.insert_extra_links(&links).await {
                warn!(%order_number, error = %e, "extras associations not recorded");
                warnings.push(format!("extras not recorded: {}", e));
            }
        }

        // Steps 3 and 4: loyalty-point read-modify-write.
        let points_earned = draft.earned_points();
        match self.store.fetch_points(user_id).await {
            Ok(current) => {
                if let Err(e) = self
                    .store
                    .update_points(user_id, current + points_earned)
                    .await
                {
                    warn!(%order_number, error = %e, "point balance not updated");
                    warnings.push(format!("points not credited: {}", e));
                }
            }
            Err(e) => {
                warn!(%order_number, error = %e, "point balance not readable");
                warnings.push(format!("points not credited: {}", e));
            }
        }

        info!(
            %order_number,
            reference_id = %draft.reference_id,
            total = %draft.rounded_total(),
            points_earned,
            warning_count = warnings.len(),
            "order committed"
        );

        Ok(PersistedOrderResult {
            order_number,
            reference_id: draft.reference_id.clone(),
            total: draft.rounded_total(),
            points_earned,
            warnings,
        })
    }
}
