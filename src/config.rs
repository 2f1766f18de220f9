use chrono::{FixedOffset, Offset, Utc};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::models::VendorKey;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CART_CACHE_BACKEND: &str = "in-memory";
const DEFAULT_CART_CACHE_NAMESPACE: &str = "carebook:cart";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_PAYMENT_TIMEOUT_SECS: u64 = 900;
const DEFAULT_SUPPORT_CONTACT: &str = "support@carebook.example";

/// Connection settings for one diagnostics vendor.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VendorEndpoint {
    #[serde(default)]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// One section per diagnostics vendor; a missing section disables the vendor.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VendorsConfig {
    #[serde(default)]
    pub partner_clinic: Option<VendorEndpoint>,
    #[serde(default)]
    pub home_collection: Option<VendorEndpoint>,
    #[serde(default)]
    pub phlebotomy: Option<VendorEndpoint>,
    #[serde(default)]
    pub lab_network: Option<VendorEndpoint>,
}

impl VendorsConfig {
    pub fn endpoint(&self, vendor: VendorKey) -> Option<&VendorEndpoint> {
        let section = match vendor {
            VendorKey::Clinic => None,
            VendorKey::PartnerClinic => self.partner_clinic.as_ref(),
            VendorKey::HomeCollection => self.home_collection.as_ref(),
            VendorKey::Phlebotomy => self.phlebotomy.as_ref(),
            VendorKey::LabNetwork => self.lab_network.as_ref(),
        };
        section.filter(|endpoint| endpoint.enabled)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Per-user cart cache backend: "in-memory" or "redis"
    #[serde(default = "default_cart_cache_backend")]
    #[validate(custom = "validate_cart_cache_backend")]
    pub cart_cache_backend: String,

    /// Redis connection URL (cart cache when the redis backend is selected)
    pub redis_url: String,

    /// Key prefix for cached carts
    #[serde(default = "default_cart_cache_namespace")]
    pub cart_cache_namespace: String,

    /// Clinic slot/booking/cart service
    #[validate(url)]
    pub clinic_base_url: String,

    /// Sponsorship lookup service
    #[validate(url)]
    pub sponsorship_base_url: String,

    /// Payment gateway API
    #[validate(url)]
    pub payment_gateway_base_url: String,

    /// Payment gateway key id (public, sent to the checkout modal)
    pub payment_key_id: String,

    /// Payment gateway key secret (signs completion callbacks)
    #[validate(length(min = 8))]
    pub payment_key_secret: String,

    /// How long a payment session may stay open before it counts as dismissed
    #[serde(default = "default_payment_timeout_secs")]
    pub payment_timeout_secs: u64,

    /// ISO currency code for every charge
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Vendor wall-clock offset from UTC used to decide slot expiry
    #[serde(default = "default_utc_offset_minutes")]
    #[validate(range(min = -720, max = 840))]
    pub utc_offset_minutes: i32,

    /// Outbound HTTP timeout
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Retries after the first attempt for slot listing and vendor order placement
    #[serde(default = "default_vendor_retry_attempts")]
    #[validate(range(max = 3))]
    pub vendor_retry_attempts: u32,

    /// Base backoff between retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a finished or unpaid booking stays addressable after its last transition
    #[serde(default = "default_booking_retention_secs")]
    #[validate(range(min = 60))]
    pub booking_retention_secs: u64,

    /// Number of failures before a vendor's circuit breaker opens
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failure_threshold: u32,

    /// Circuit breaker reset timeout in seconds
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,

    /// Shown to users when a paid booking could not be confirmed
    #[serde(default = "default_support_contact")]
    pub support_contact: String,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Comma-separated CORS origins; unset allows any origin outside production
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Diagnostics vendors
    #[serde(default)]
    pub vendors: VendorsConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the collaborator URLs
    pub fn new(
        clinic_base_url: String,
        sponsorship_base_url: String,
        payment_gateway_base_url: String,
        payment_key_id: String,
        payment_key_secret: String,
        environment: String,
    ) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            cart_cache_backend: default_cart_cache_backend(),
            redis_url: "redis://localhost:6379".to_string(),
            cart_cache_namespace: default_cart_cache_namespace(),
            clinic_base_url,
            sponsorship_base_url,
            payment_gateway_base_url,
            payment_key_id,
            payment_key_secret,
            payment_timeout_secs: default_payment_timeout_secs(),
            currency: default_currency(),
            utc_offset_minutes: default_utc_offset_minutes(),
            http_timeout_secs: default_http_timeout_secs(),
            vendor_retry_attempts: default_vendor_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            booking_retention_secs: default_booking_retention_secs(),
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_timeout_secs: default_circuit_breaker_timeout(),
            support_contact: default_support_contact(),
            event_channel_capacity: default_event_channel_capacity(),
            cors_allowed_origins: None,
            vendors: VendorsConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Parsed CORS origins, empty entries dropped.
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn booking_retention(&self) -> Duration {
        Duration::from_secs(self.booking_retention_secs)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }

    /// Vendor wall-clock offset. Falls back to UTC if the configured value is out of range.
    pub fn vendor_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Cross-field checks the derive cannot express.
    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.cart_cache_backend.eq_ignore_ascii_case("redis") && self.redis_url.trim().is_empty()
        {
            let mut err = ValidationError::new("redis_url");
            err.message = Some("redis_url is required when cart_cache_backend is redis".into());
            errors.add("redis_url", err);
        }

        for vendor in VendorKey::ALL {
            if let Some(endpoint) = self.vendors.endpoint(vendor) {
                if endpoint.base_url.trim().is_empty() {
                    let mut err = ValidationError::new("vendors");
                    err.message = Some(format!("{} is enabled without a base_url", vendor).into());
                    errors.add("vendors", err);
                }
                if vendor == VendorKey::HomeCollection
                    && (endpoint.username.is_none() || endpoint.password.is_none())
                {
                    let mut err = ValidationError::new("vendors");
                    err.message = Some("home_collection needs username and password".into());
                    errors.add("vendors", err);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_cart_cache_backend() -> String {
    DEFAULT_CART_CACHE_BACKEND.to_string()
}

fn default_cart_cache_namespace() -> String {
    DEFAULT_CART_CACHE_NAMESPACE.to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_utc_offset_minutes() -> i32 {
    DEFAULT_UTC_OFFSET_MINUTES
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_payment_timeout_secs() -> u64 {
    DEFAULT_PAYMENT_TIMEOUT_SECS
}

fn default_vendor_retry_attempts() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_booking_retention_secs() -> u64 {
    3600
}

fn default_circuit_breaker_failures() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    60
}

fn default_support_contact() -> String {
    DEFAULT_SUPPORT_CONTACT.to_string()
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn validate_cart_cache_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("cart_cache_backend");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("carebook={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // payment_key_secret has no default: it must come from a file or APP__PAYMENT_KEY_SECRET.
    let config = Config::builder()
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("clinic_base_url", "http://localhost:9001")?
        .set_default("sponsorship_base_url", "http://localhost:9002")?
        .set_default("payment_gateway_base_url", "http://localhost:9003")?
        .set_default("payment_key_id", "rzp_test_key")?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("payment_key_secret").is_err() {
        error!("Payment key secret is not configured. Set APP__PAYMENT_KEY_SECRET.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "payment_key_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
