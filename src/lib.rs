//! Storefront Checkout Core
//!
//! The checkout/payment reconciliation core of a mobile storefront: cart
//! state, order drafting, hosted payment sessions, outcome verification,
//! order persistence, and loyalty point accrual. The UI shell embedding
//! this crate provides screens and navigation; everything stateful about
//! placing an order lives here.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod events;
pub mod retry;
pub mod services;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::auth::{SessionProvider, StaticSessionProvider};
use crate::config::AppConfig;
use crate::errors::CheckoutError;
use crate::events::Event;
use crate::services::cart::CartStore;
use crate::services::checkout::CheckoutOrchestrator;
use crate::services::payment_gateway::{HostedCheckoutClient, PaymentGateway};
use crate::services::pending_order::PendingOrderStore;
use crate::services::persistence::{HostedDataStore, OrderPersistenceGateway, OrderStore};
use crate::storage::{JsonFileStore, KeyValueStore};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The constructed component graph handed to the host app.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub cart: Arc<CartStore>,
    pub session: Arc<StaticSessionProvider>,
    pub orchestrator: Arc<CheckoutOrchestrator>,
}

impl AppState {
    /// Builds the full production stack from configuration: HTTP clients
    /// against the configured endpoints and a file-backed durable store.
    ///
    /// Returns the state plus the event receiver the host UI should drain.
    pub fn from_config(
        config: AppConfig,
    ) -> Result<(Self, mpsc::Receiver<Event>), CheckoutError> {
        let gateway: Arc<dyn PaymentGateway> =
            Arc::new(HostedCheckoutClient::new(&config.gateway)?);
        let store: Arc<dyn OrderStore> = Arc::new(HostedDataStore::new(&config.data_service)?);
        let kv: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&config.storage.path));
        Self::with_components(config, gateway, store, kv)
    }

    /// Builds the graph from explicit components. Tests and alternative
    /// runtimes inject their own gateway, data store, or storage here.
    pub fn with_components(
        config: AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn OrderStore>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Result<(Self, mpsc::Receiver<Event>), CheckoutError> {
        let config = Arc::new(config);
        let cart = Arc::new(CartStore::new());
        let session = Arc::new(StaticSessionProvider::new());
        let (events, rx) = events::channel(EVENT_CHANNEL_CAPACITY);

        let persistence = OrderPersistenceGateway::new(store);
        let pending = PendingOrderStore::new(
            kv,
            Duration::from_secs(config.order.pending_order_ttl_secs),
        );

        let orchestrator = Arc::new(CheckoutOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&cart),
            gateway,
            persistence,
            pending,
            Arc::clone(&session) as Arc<dyn SessionProvider>,
            events,
        ));

        Ok((
            Self {
                config,
                cart,
                session,
                orchestrator,
            },
            rx,
        ))
    }
}

pub mod prelude {
    pub use crate::auth::{SessionProvider, StaticSessionProvider, UserId};
    pub use crate::config::{AppConfig, ReferenceStrategy};
    pub use crate::errors::CheckoutError;
    pub use crate::events::{Event, EventSender};
    pub use crate::services::cart::{CartLine, CartSnapshot, CartStore, ProductSelection};
    pub use crate::services::checkout::{
        CheckoutOrchestrator, CheckoutOutcome, CheckoutState, PaymentRedirect, ReturnParams,
    };
    pub use crate::services::draft::{OrderDraft, OrderDraftBuilder};
    pub use crate::services::payment_gateway::{
        HostedCheckoutClient, PaymentGateway, PaymentSession, PaymentStatus, StatusQuery,
    };
    pub use crate::services::pending_order::{PendingOrderMarker, PendingOrderStore};
    pub use crate::services::persistence::{
        HostedDataStore, OrderPersistenceGateway, OrderStore, PersistedOrderResult,
    };
    pub use crate::AppState;
}
