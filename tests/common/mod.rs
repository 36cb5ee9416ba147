#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use storefront_checkout::errors::CheckoutError;
use storefront_checkout::events::Event;
use storefront_checkout::prelude::*;
use storefront_checkout::services::persistence::{
    ExtraLink, InsertedOrderRow, OrderRow, StoreError,
};
use storefront_checkout::storage::MemoryStore;

/// Scriptable payment gateway double.
///
/// `poll_script` entries are consumed one per poll; once empty, polls return
/// `default_poll`. Every query is recorded for assertions.
pub struct MockGateway {
    pub fail_create: bool,
    pub session_token: Option<String>,
    pub default_poll: PaymentStatus,
    pub poll_script: Mutex<VecDeque<Result<PaymentStatus, CheckoutError>>>,
    pub create_calls: AtomicU32,
    pub poll_queries: Mutex<Vec<StatusQuery>>,
}

impl MockGateway {
    pub fn with_polls(polls: Vec<PaymentStatus>) -> Arc<Self> {
        Arc::new(Self {
            fail_create: false,
            session_token: Some("tok_test".to_string()),
            default_poll: PaymentStatus::Pending,
            poll_script: Mutex::new(polls.into_iter().map(Ok).collect()),
            create_calls: AtomicU32::new(0),
            poll_queries: Mutex::new(Vec::new()),
        })
    }

    pub fn failing_create() -> Arc<Self> {
        Arc::new(Self {
            fail_create: true,
            session_token: None,
            default_poll: PaymentStatus::Pending,
            poll_script: Mutex::new(VecDeque::new()),
            create_calls: AtomicU32::new(0),
            poll_queries: Mutex::new(Vec::new()),
        })
    }

    pub fn create_call_count(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn recorded_queries(&self) -> Vec<StatusQuery> {
        self.poll_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_session(
        &self,
        amount: Decimal,
        reference_id: &str,
    ) -> Result<PaymentSession, CheckoutError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(CheckoutError::gateway_http(500, "session refused"));
        }
        Ok(PaymentSession {
            reference_id: reference_id.to_string(),
            amount,
            checkout_url: "https://pay.example/abc".to_string(),
            session_token: self.session_token.clone(),
            status: PaymentStatus::Created,
        })
    }

    async fn poll_status(&self, query: &StatusQuery) -> Result<PaymentStatus, CheckoutError> {
        self.poll_queries.lock().unwrap().push(query.clone());
        match self.poll_script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.default_poll),
        }
    }

    fn payment_form_html(&self, session: &PaymentSession) -> Option<String> {
        session
            .session_token
            .as_deref()
            .map(|token| format!("<form><input name=\"token\" value=\"{token}\" /></form>"))
    }
}

/// Recording order store double.
#[derive(Default)]
pub struct RecordingStore {
    pub fail_orders: bool,
    pub current_points: i64,
    pub inserted_rows: Mutex<Vec<OrderRow>>,
    pub inserted_links: Mutex<Vec<ExtraLink>>,
    pub written_points: Mutex<Option<i64>>,
}

impl RecordingStore {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_orders: true,
            ..Self::default()
        })
    }

    pub fn order_count(&self) -> usize {
        self.inserted_rows.lock().unwrap().len()
    }
}

#[async_trait]
impl OrderStore for RecordingStore {
    async fn insert_order_rows(
        &self,
        rows: &[OrderRow],
    ) -> Result<Vec<InsertedOrderRow>, StoreError> {
        if self.fail_orders {
            return Err(StoreError::Http {
                status: 500,
                body: "insert refused".to_string(),
            });
        }
        self.inserted_rows
            .lock()
            .unwrap()
            .extend(rows.iter().cloned());
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, row)| InsertedOrderRow {
                id: 500 + i as i64,
                product_id: row.product_id,
            })
            .collect())
    }

    async fn insert_extra_links(&self, links: &[ExtraLink]) -> Result<(), StoreError> {
        self.inserted_links
            .lock()
            .unwrap()
            .extend(links.iter().cloned());
        Ok(())
    }

    async fn fetch_points(&self, _user_id: Uuid) -> Result<i64, StoreError> {
        Ok(self.current_points)
    }

    async fn update_points(&self, _user_id: Uuid, points: i64) -> Result<(), StoreError> {
        *self.written_points.lock().unwrap() = Some(points);
        Ok(())
    }
}

/// Configuration tuned so verification loops finish in milliseconds.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.gateway.settle_delay_ms = 0;
    config.gateway.poll_initial_backoff_ms = 1;
    config.gateway.poll_max_backoff_ms = 2;
    config.gateway.poll_max_attempts = 3;
    config.gateway.poll_overall_cap_secs = 5;
    config.order.reference_prefix = "FD".to_string();
    config.order.reference_strategy = ReferenceStrategy::TimestampAmount;
    config
}

pub struct TestHarness {
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub store: Arc<RecordingStore>,
    pub kv: Arc<MemoryStore>,
    pub events: mpsc::Receiver<Event>,
    pub user_id: Uuid,
}

/// Builds the app graph around the given doubles, with a signed-in user.
pub fn harness_with(gateway: Arc<MockGateway>, store: Arc<RecordingStore>) -> TestHarness {
    let kv = Arc::new(MemoryStore::new());
    let (state, events) = AppState::with_components(
        test_config(),
        gateway.clone() as Arc<dyn PaymentGateway>,
        store.clone() as Arc<dyn OrderStore>,
        kv.clone() as Arc<dyn storefront_checkout::storage::KeyValueStore>,
    )
    .expect("app graph should build");

    let user_id = Uuid::new_v4();
    state.session.sign_in(user_id);

    TestHarness {
        state,
        gateway,
        store,
        kv,
        events,
        user_id,
    }
}

pub fn seed_cart(state: &AppState, unit_price: Decimal, quantity: u32) -> Uuid {
    let product_id = Uuid::new_v4();
    state.cart.add(
        ProductSelection {
            product_id,
            name: "Turkey club".to_string(),
            unit_price,
            selected_extra_ids: Default::default(),
        },
        quantity,
    );
    product_id
}

/// Collects whatever events have been published so far.
pub fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
