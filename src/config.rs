use std::env;
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_GATEWAY_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_CREATE_SESSION_PATH: &str = "/api/payments/create-session";
const DEFAULT_STATUS_PATH: &str = "/api/payments/verify-payment";
const DEFAULT_PAYMENT_PAGE_URL: &str = "https://test.authorize.net/payment/payment";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SETTLE_DELAY_MS: u64 = 2_000;
const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_POLL_INITIAL_BACKOFF_MS: u64 = 1_500;
const DEFAULT_POLL_MAX_BACKOFF_MS: u64 = 15_000;
const DEFAULT_POLL_OVERALL_CAP_SECS: u64 = 90;
const DEFAULT_REFERENCE_PREFIX: &str = "ORD";
const DEFAULT_TAX_RATE: f64 = 0.06;
const DEFAULT_PENDING_ORDER_TTL_SECS: u64 = 900;
const DEFAULT_DATA_SERVICE_BASE_URL: &str = "http://localhost:54321/rest/v1";
const DEFAULT_STORAGE_PATH: &str = "storefront-checkout-state.json";

/// How order reference ids are minted. Two schemes exist because the two
/// supported gateways expect different shapes; the choice is configuration,
/// never code.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceStrategy {
    /// `{PREFIX}-{YYYYMMDD}-{4-digit-random}`
    #[default]
    DateRandom,
    /// `{PREFIX}-{epoch_ms}-{amount}`
    TimestampAmount,
}

/// Payment gateway connection and verification tuning.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentGatewayConfig {
    /// Base URL of the backend that brokers gateway sessions
    #[serde(default = "default_gateway_base_url")]
    #[validate(url)]
    pub base_url: String,

    /// Path of the session-creation endpoint
    #[serde(default = "default_create_session_path")]
    pub create_session_path: String,

    /// Path of the status-check endpoint
    #[serde(default = "default_status_path")]
    pub status_path: String,

    /// Hosted payment page the session token is form-posted to (web runtime)
    #[serde(default = "default_payment_page_url")]
    #[validate(url)]
    pub payment_page_url: String,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,

    /// Delay before the first status poll, letting the gateway settle
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Maximum number of status polls per verification
    #[serde(default = "default_poll_max_attempts")]
    #[validate(range(min = 1, max = 50))]
    pub poll_max_attempts: u32,

    /// Initial backoff between polls in milliseconds
    #[serde(default = "default_poll_initial_backoff_ms")]
    pub poll_initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_poll_max_backoff_ms")]
    pub poll_max_backoff_ms: u64,

    /// Wall-clock cap on the whole verification loop in seconds
    #[serde(default = "default_poll_overall_cap_secs")]
    #[validate(range(min = 5, max = 600))]
    pub poll_overall_cap_secs: u64,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            create_session_path: default_create_session_path(),
            status_path: default_status_path(),
            payment_page_url: default_payment_page_url(),
            request_timeout_secs: default_request_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            poll_max_attempts: default_poll_max_attempts(),
            poll_initial_backoff_ms: default_poll_initial_backoff_ms(),
            poll_max_backoff_ms: default_poll_max_backoff_ms(),
            poll_overall_cap_secs: default_poll_overall_cap_secs(),
        }
    }
}

/// Order pricing and reference generation.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrderConfig {
    #[serde(default = "default_reference_prefix")]
    #[validate(length(min = 1, max = 12))]
    pub reference_prefix: String,

    #[serde(default)]
    pub reference_strategy: ReferenceStrategy,

    /// Sales tax rate applied to the order subtotal
    #[serde(default = "default_tax_rate")]
    #[validate(range(min = 0.0, max = 0.5))]
    pub tax_rate: f64,

    /// Lifetime of the resumable "order in progress" window in seconds
    #[serde(default = "default_pending_order_ttl_secs")]
    #[validate(range(min = 60, max = 86400))]
    pub pending_order_ttl_secs: u64,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            reference_prefix: default_reference_prefix(),
            reference_strategy: ReferenceStrategy::default(),
            tax_rate: default_tax_rate(),
            pending_order_ttl_secs: default_pending_order_ttl_secs(),
        }
    }
}

/// Hosted data service (orders, points) connection.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DataServiceConfig {
    #[serde(default = "default_data_service_base_url")]
    #[validate(url)]
    pub base_url: String,

    /// API key sent with every data-service request. Empty is tolerated in
    /// development profiles only.
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_data_service_base_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Durable local storage for cross-restart keys.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    #[validate(length(min = 1))]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    #[validate]
    pub gateway: PaymentGatewayConfig,

    #[serde(default)]
    #[validate]
    pub order: OrderConfig,

    #[serde(default)]
    #[validate]
    pub data_service: DataServiceConfig,

    #[serde(default)]
    #[validate]
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            gateway: PaymentGatewayConfig::default(),
            order: OrderConfig::default(),
            data_service: DataServiceConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_gateway_base_url() -> String {
    DEFAULT_GATEWAY_BASE_URL.to_string()
}
fn default_create_session_path() -> String {
    DEFAULT_CREATE_SESSION_PATH.to_string()
}
fn default_status_path() -> String {
    DEFAULT_STATUS_PATH.to_string()
}
fn default_payment_page_url() -> String {
    DEFAULT_PAYMENT_PAGE_URL.to_string()
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}
fn default_poll_max_attempts() -> u32 {
    DEFAULT_POLL_MAX_ATTEMPTS
}
fn default_poll_initial_backoff_ms() -> u64 {
    DEFAULT_POLL_INITIAL_BACKOFF_MS
}
fn default_poll_max_backoff_ms() -> u64 {
    DEFAULT_POLL_MAX_BACKOFF_MS
}
fn default_poll_overall_cap_secs() -> u64 {
    DEFAULT_POLL_OVERALL_CAP_SECS
}
fn default_reference_prefix() -> String {
    DEFAULT_REFERENCE_PREFIX.to_string()
}
fn default_tax_rate() -> f64 {
    DEFAULT_TAX_RATE
}
fn default_pending_order_ttl_secs() -> u64 {
    DEFAULT_PENDING_ORDER_TTL_SECS
}
fn default_data_service_base_url() -> String {
    DEFAULT_DATA_SERVICE_BASE_URL.to_string()
}
fn default_storage_path() -> String {
    DEFAULT_STORAGE_PATH.to_string()
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml), when present
/// 2. Environment-specific config (config/{env}.toml), when present
/// 3. Environment variables (APP__*, e.g. APP__GATEWAY__BASE_URL)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    let mut builder = Config::builder();

    if Path::new(CONFIG_DIR).exists() {
        builder = builder
            .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
            .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));
    } else {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let settings = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let config: AppConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Initializes tracing using the provided log level as the default filter.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_checkout={}", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}
