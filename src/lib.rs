//! Tollgate - payment gating for a mobile-money job marketplace
//!
//! Decides whether a user may post a job or apply to one under the
//! admin-configured billing policy, collects fees and subscriptions through
//! the ZenoPay mobile-money gateway, and converges local payment state with
//! the gateway through webhooks and a periodic sweep.
//!
//! # Features
//!
//! - **Authorization**: free, subscription, pay-per-job, pay-per-application and hybrid modes
//! - **Ledgers**: forward-only transaction status, one active subscription per user
//! - **Gateway**: ZenoPay client with retry, backoff and phone normalisation
//! - **Reconciliation**: idempotent webhook handling and a pending-transaction sweep
//! - **Database**: SeaORM store with migrations (`database` feature)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tollgate::{App, ConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tollgate::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let app = App::from_config(config).await?;
//!
//!     app.serve().await?;
//!     Ok(())
//! }
//! ```

mod app;
pub mod billing;
mod config;
mod core;
mod error;
pub mod health;
pub mod http;
mod middleware;
pub mod utils;

// Re-exports for public API
pub use app::{AppContext, AppContextBuilder};
pub use config::{
    Config, ConfigBuilder, GatewayConfig, LoggingConfig, PaymentsConfig, ServerConfig,
    WebhookConfig,
};
pub use core::{App, AppBuilder};
pub use error::{ErrorContext, ErrorWithContext, Result, TollgateError};
pub use health::{ComponentHealth, HealthCheck, HealthChecker, HealthStatus};
pub use http::{AdminSettingsModule, PaymentsModule, RouteModule};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with defaults
///
/// Call once at start-up, before building the [`App`].
///
/// # Environment Variables
///
/// - `RUST_LOG`: filter directives (e.g. "info", "tollgate::billing=debug")
/// - `TOLLGATE_LOG_JSON`: "true" for JSON lines
pub fn init_tracing() {
    let json = utils::parse_env_with_prefix::<bool>("LOG_JSON").unwrap_or(false);
    install_subscriber(filter_or("info"), json);
}

/// Initialize tracing from [`Config::logging`].
///
/// `RUST_LOG` still wins when set.
pub fn init_tracing_with_config(config: &Config) {
    install_subscriber(filter_or(&config.logging.level), config.logging.json);
}

fn filter_or(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn install_subscriber(filter: EnvFilter, json: bool) {
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
