use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Checkout lifecycle events published for the host UI.
///
/// The orchestrator is the only producer; consumers receive them through the
/// channel handed out by [`channel`] and typically translate them into
/// toasts, navigation, or badge updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CheckoutStarted {
        user_id: Uuid,
    },
    CheckoutCancelled {
        reference_id: Option<String>,
    },
    PaymentSessionCreated {
        reference_id: String,
        amount: Decimal,
    },
    PaymentVerificationStarted {
        reference_id: String,
    },
    PaymentConfirmed {
        reference_id: String,
    },
    PaymentOutcomeAmbiguous {
        reference_id: String,
        attempts: u32,
    },
    PaymentDeclined {
        reference_id: String,
    },
    OrderPersisted {
        order_number: String,
        points_earned: i64,
        total: Decimal,
    },
    OrderPersistenceIncomplete {
        order_number: String,
        warnings: Vec<String>,
    },
    CheckoutFailed {
        reference_id: Option<String>,
        reason: String,
    },
    PendingOrderPurged {
        order_number: String,
    },
    PendingOrderExpired {
        order_number: String,
    },
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when no consumer is left.
    /// Event delivery is never allowed to fail a checkout.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(err) = self.send(event).await {
            warn!(error = %err, "event dropped");
        }
    }
}

/// Creates the event channel pair with the given buffer capacity.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Default consumer loop: logs every event. Hosts that want UI behavior run
/// their own loop over the receiver instead.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        info!(?event, "checkout event");
    }
}
