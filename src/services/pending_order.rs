use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::{KeyValueStore, StorageError};

/// Durable keys shared with earlier app versions; the marker must survive
/// an app upgrade in place.
pub const ORDER_TIMER_START_KEY: &str = "order_timer_start";
pub const ORDER_INFO_KEY: &str = "order_info";

/// Resumable "order in progress" marker.
///
/// Written after a successful commit so the UI can keep showing a pickup
/// countdown across app restarts. Expired markers must be purged before any
/// new checkout starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOrderMarker {
    pub started_at_epoch_ms: i64,
    pub order_number: String,
    pub earned_points: i64,
}

impl PendingOrderMarker {
    pub fn elapsed(&self, now_epoch_ms: i64) -> Duration {
        Duration::from_millis(now_epoch_ms.saturating_sub(self.started_at_epoch_ms).max(0) as u64)
    }

    pub fn is_expired(&self, now_epoch_ms: i64, ttl: Duration) -> bool {
        self.elapsed(now_epoch_ms) >= ttl
    }

    /// Time left on the pickup window; zero once expired.
    pub fn remaining(&self, now_epoch_ms: i64, ttl: Duration) -> Duration {
        ttl.saturating_sub(self.elapsed(now_epoch_ms))
    }
}

/// Wire shape of the `order_info` key.
#[derive(Debug, Serialize, Deserialize)]
struct OrderInfo {
    #[serde(rename = "orderNumber")]
    order_number: String,
    #[serde(rename = "earnedPoints")]
    earned_points: i64,
}

/// What a marker load found.
#[derive(Debug)]
pub enum MarkerState {
    Active(PendingOrderMarker),
    /// The marker outlived its window and has been purged.
    Expired(PendingOrderMarker),
    Absent,
}

/// Durable storage for the pending-order marker.
pub struct PendingOrderStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl PendingOrderStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stamps and persists a fresh marker for a just-committed order.
    pub async fn write(
        &self,
        order_number: &str,
        earned_points: i64,
    ) -> Result<PendingOrderMarker, StorageError> {
        let marker = PendingOrderMarker {
            started_at_epoch_ms: Utc::now().timestamp_millis(),
            order_number: order_number.to_string(),
            earned_points,
        };
        self.write_marker(&marker).await?;
        info!(order_number, "pending order marker written");
        Ok(marker)
    }

    /// Persists an explicit marker. Exposed so restart scenarios can be
    /// reconstructed; production code goes through [`PendingOrderStore::write`].
    pub async fn write_marker(&self, marker: &PendingOrderMarker) -> Result<(), StorageError> {
        self.store
            .put(
                ORDER_TIMER_START_KEY,
                &marker.started_at_epoch_ms.to_string(),
            )
            .await?;
        let info = OrderInfo {
            order_number: marker.order_number.clone(),
            earned_points: marker.earned_points,
        };
        self.store
            .put(ORDER_INFO_KEY, &serde_json::to_string(&info)?)
            .await
    }

    /// Loads the marker, purging it when expired or unreadable.
    pub async fn load(&self) -> Result<MarkerState, StorageError> {
        let started = match self.store.get(ORDER_TIMER_START_KEY).await? {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(ms) => ms,
                Err(_) => {
                    warn!(%raw, "unreadable pending order timer, purging");
                    self.purge().await?;
                    return Ok(MarkerState::Absent);
                }
            },
            None => return Ok(MarkerState::Absent),
        };

        let info: OrderInfo = match self.store.get(ORDER_INFO_KEY).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(info) => info,
                Err(err) => {
                    warn!(error = %err, "unreadable pending order info, purging");
                    self.purge().await?;
                    return Ok(MarkerState::Absent);
                }
            },
            None => {
                // Timer without info is a half-written marker.
                self.purge().await?;
                return Ok(MarkerState::Absent);
            }
        };

        let marker = PendingOrderMarker {
            started_at_epoch_ms: started,
            order_number: info.order_number,
            earned_points: info.earned_points,
        };

        if marker.is_expired(Utc::now().timestamp_millis(), self.ttl) {
            debug!(order_number = %marker.order_number, "pending order marker expired");
            self.purge().await?;
            return Ok(MarkerState::Expired(marker));
        }

        Ok(MarkerState::Active(marker))
    }

    /// Removes the marker, returning the order number it carried, if any.
    pub async fn purge(&self) -> Result<Option<String>, StorageError> {
        let order_number = match self.store.get(ORDER_INFO_KEY).await? {
            Some(raw) => serde_json::from_str::<OrderInfo>(&raw)
                .ok()
                .map(|info| info.order_number),
            None => None,
        };
        self.store.remove(ORDER_TIMER_START_KEY).await?;
        self.store.remove(ORDER_INFO_KEY).await?;
        Ok(order_number)
    }
}
