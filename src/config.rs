use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::billing::{PaymentLimits, SweepConfig, ZenoPayConfig};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};

/// Main configuration for a Tollgate service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub gateway: GatewayConfig,
    pub payments: PaymentsConfig,
    pub webhook: WebhookConfig,
    /// Selects the SeaORM store when set and the `database` feature is on.
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request body size in bytes (default: 1MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// ZenoPay connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    /// Without a key the gateway is unconfigured and initiation is refused.
    #[serde(skip)]
    pub api_key: Option<SecretString>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Mobile-money confirmation is slow, so this is generous.
    #[serde(default = "default_gateway_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentsConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_min_amount")]
    pub min_amount: i64,
    #[serde(default = "default_max_amount")]
    pub max_amount: i64,
    /// Age before the sweep polls a pending transaction.
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_minutes: i64,
    /// Age after which an unpaid pending transaction is failed.
    #[serde(default = "default_pending_expiry")]
    pub pending_expiry_minutes: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: u64,
    #[serde(default = "default_refund_window")]
    pub refund_window_days: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Falls back to the gateway API key, which ZenoPay presents on callbacks.
    #[serde(skip)]
    pub secret: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            gateway: GatewayConfig::default(),
            payments: PaymentsConfig::default(),
            webhook: WebhookConfig::default(),
            database_url: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            api_key: None,
            webhook_url: None,
            timeout_seconds: default_gateway_timeout(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            min_amount: default_min_amount(),
            max_amount: default_max_amount(),
            pending_timeout_minutes: default_pending_timeout(),
            pending_expiry_minutes: default_pending_expiry(),
            sweep_interval_seconds: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            refund_window_days: default_refund_window(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_max_body_size() -> usize {
    1024 * 1024 // 1MB default
}

fn default_gateway_base_url() -> String {
    crate::billing::gateway::DEFAULT_BASE_URL.to_string()
}

fn default_gateway_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_currency() -> String {
    "TZS".to_string()
}

fn default_min_amount() -> i64 {
    100
}

fn default_max_amount() -> i64 {
    1_000_000
}

fn default_pending_timeout() -> i64 {
    30
}

fn default_pending_expiry() -> i64 {
    24 * 60
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sweep_batch_size() -> u64 {
    100
}

fn default_refund_window() -> i64 {
    7
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl GatewayConfig {
    /// Client settings for the live ZenoPay client.
    pub fn client_config(&self) -> ZenoPayConfig {
        ZenoPayConfig::new()
            .base_url(&self.base_url)
            .webhook_url(self.webhook_url.clone())
            .timeout_seconds(self.timeout_seconds)
            .max_retries(self.max_retries)
            .base_delay_ms(self.base_delay_ms)
            .max_delay_ms(self.max_delay_ms)
    }
}

impl PaymentsConfig {
    pub fn limits(&self) -> PaymentLimits {
        PaymentLimits {
            currency: self.currency.clone(),
            min_amount: self.min_amount,
            max_amount: self.max_amount,
            refund_window: chrono::Duration::days(self.refund_window_days),
        }
    }

    pub fn sweep(&self) -> SweepConfig {
        SweepConfig {
            pending_timeout: chrono::Duration::minutes(self.pending_timeout_minutes),
            pending_expiry: chrono::Duration::minutes(self.pending_expiry_minutes),
            batch_size: self.sweep_batch_size,
            interval: std::time::Duration::from_secs(self.sweep_interval_seconds),
            ..SweepConfig::default()
        }
    }
}

impl Config {
    /// The secret callbacks must present: the webhook secret if set,
    /// otherwise the gateway API key, otherwise empty (rejects everything).
    pub fn effective_webhook_secret(&self) -> SecretString {
        self.webhook
            .secret
            .clone()
            .or_else(|| self.gateway.api_key.clone())
            .unwrap_or_else(|| SecretString::from(String::new()))
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    /// Set the maximum request body size in bytes
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.config.server.max_body_size = max_body_size;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.config.gateway = gateway;
        self
    }

    pub fn with_gateway_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.gateway.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_payments(mut self, payments: PaymentsConfig) -> Self {
        self.config.payments = payments;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.webhook.secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = Some(url.into());
        self
    }

    /// Load configuration from environment variables with TOLLGATE_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        // Check TOLLGATE_PORT first, fall back to PORT (for Railway/Heroku compatibility)
        if let Some(port) = parse_env_with_prefix("PORT") {
            self.config.server.port = port;
        }
        if let Some(size) = parse_env_with_prefix("MAX_BODY_SIZE") {
            self.config.server.max_body_size = size;
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        // Gateway
        let gateway = &mut self.config.gateway;
        if let Some(url) = get_env_with_prefix("ZENOPAY_BASE_URL") {
            gateway.base_url = url;
        }
        if let Some(key) = get_env_with_prefix("ZENOPAY_API_KEY") {
            gateway.api_key = Some(SecretString::from(key));
        }
        if let Some(url) = get_env_with_prefix("ZENOPAY_WEBHOOK_URL") {
            gateway.webhook_url = Some(url);
        }
        if let Some(secs) = parse_env_with_prefix("ZENOPAY_TIMEOUT_SECONDS") {
            gateway.timeout_seconds = secs;
        }
        if let Some(retries) = parse_env_with_prefix("ZENOPAY_MAX_RETRIES") {
            gateway.max_retries = retries;
        }
        if let Some(ms) = parse_env_with_prefix("ZENOPAY_BASE_DELAY_MS") {
            gateway.base_delay_ms = ms;
        }
        if let Some(ms) = parse_env_with_prefix("ZENOPAY_MAX_DELAY_MS") {
            gateway.max_delay_ms = ms;
        }

        // Payments
        let payments = &mut self.config.payments;
        if let Some(currency) = get_env_with_prefix("PAYMENT_CURRENCY") {
            payments.currency = currency.to_uppercase();
        }
        if let Some(min) = parse_env_with_prefix("PAYMENT_MIN_AMOUNT") {
            payments.min_amount = min;
        }
        if let Some(max) = parse_env_with_prefix("PAYMENT_MAX_AMOUNT") {
            payments.max_amount = max;
        }
        if let Some(minutes) = parse_env_with_prefix("PAYMENT_PENDING_TIMEOUT_MINUTES") {
            payments.pending_timeout_minutes = minutes;
        }
        if let Some(minutes) = parse_env_with_prefix("PAYMENT_PENDING_EXPIRY_MINUTES") {
            payments.pending_expiry_minutes = minutes;
        }
        if let Some(secs) = parse_env_with_prefix("SWEEP_INTERVAL_SECONDS") {
            payments.sweep_interval_seconds = secs;
        }
        if let Some(size) = parse_env_with_prefix("SWEEP_BATCH_SIZE") {
            payments.sweep_batch_size = size;
        }
        if let Some(days) = parse_env_with_prefix("REFUND_WINDOW_DAYS") {
            payments.refund_window_days = days;
        }

        if let Some(secret) = get_env_with_prefix("WEBHOOK_SECRET") {
            self.config.webhook.secret = Some(SecretString::from(secret));
        }

        if let Some(url) = get_env_with_prefix("DATABASE_URL") {
            self.config.database_url = Some(url);
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration is invalid:
    /// - Invalid server address (host:port)
    /// - Invalid log level
    /// - Amount bounds that are empty or negative
    /// - Zero timeouts, intervals or batch sizes
    pub fn build(self) -> crate::error::Result<Config> {
        fn bad(msg: impl Into<String>) -> crate::error::TollgateError {
            crate::error::TollgateError::bad_request(msg)
        }

        // Validate server address
        self.config.server.addr().map_err(|e| {
            bad(format!(
                "Invalid server address {}:{} - {}",
                self.config.server.host, self.config.server.port, e
            ))
        })?;

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(bad(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.server.port == 0 {
            return Err(bad("Server port must be greater than 0"));
        }

        if self.config.server.max_body_size == 0 {
            return Err(bad("Maximum body size must be greater than 0"));
        }

        let gateway = &self.config.gateway;
        if gateway.timeout_seconds == 0 {
            return Err(bad("Gateway timeout must be greater than 0"));
        }
        if gateway.base_delay_ms > gateway.max_delay_ms {
            return Err(bad("Gateway base_delay_ms must not exceed max_delay_ms"));
        }
        if let Some(key) = &gateway.api_key {
            if key.expose_secret().trim().is_empty() {
                return Err(bad("Gateway API key must not be blank"));
            }
        }

        let payments = &self.config.payments;
        if payments.currency.len() != 3 {
            return Err(bad(format!(
                "Currency must be a 3-letter code, got: {}",
                payments.currency
            )));
        }
        if payments.min_amount <= 0 || payments.max_amount < payments.min_amount {
            return Err(bad(format!(
                "Invalid amount bounds: min {} max {}",
                payments.min_amount, payments.max_amount
            )));
        }
        if payments.pending_timeout_minutes <= 0
            || payments.pending_expiry_minutes < payments.pending_timeout_minutes
        {
            return Err(bad(
                "Pending expiry must be at least the pending timeout, and both greater than 0",
            ));
        }
        if payments.sweep_interval_seconds == 0 || payments.sweep_batch_size == 0 {
            return Err(bad("Sweep interval and batch size must be greater than 0"));
        }
        if payments.refund_window_days < 0 {
            return Err(bad("Refund window must not be negative"));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
