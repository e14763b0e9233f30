use std::sync::Arc;

use secrecy::SecretString;

use crate::billing::{
    default_catalog, BillingServices, BillingStore, InMemoryBillingStore, LiveZenoPayClient,
    PaymentGateway, UnconfiguredGateway,
};
use crate::config::Config;
use crate::error::Result;

/// Application context for dependency injection and shared state
///
/// Handlers receive this through `State<AppContext>`. It is cheap to clone:
/// every service inside shares its store behind an `Arc`.
#[derive(Clone)]
pub struct AppContext {
    pub billing: BillingServices,
}

impl AppContext {
    pub fn new(billing: BillingServices) -> Self {
        Self { billing }
    }

    /// Builder pattern for constructing AppContext
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::new()
    }

    /// Wire the billing services described by `config`.
    ///
    /// Picks the SeaORM store when a database URL is configured (running
    /// migrations first), otherwise the in-memory store. Without a gateway
    /// API key, payment initiation is refused. The default plan catalog is
    /// seeded either way.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = build_store(config).await?;

        let gateway: Arc<dyn PaymentGateway> = match &config.gateway.api_key {
            Some(key) => Arc::new(LiveZenoPayClient::new(
                key.clone(),
                config.gateway.client_config(),
            )?),
            None => {
                tracing::warn!(
                    "No ZenoPay API key configured, payment initiation will be refused"
                );
                Arc::new(UnconfiguredGateway)
            }
        };

        let billing = BillingServices::builder(store)
            .gateway(gateway)
            .webhook_secret(config.effective_webhook_secret())
            .limits(config.payments.limits())
            .sweep(config.payments.sweep())
            .build();

        billing.plans.seed(default_catalog()).await?;

        Ok(Self { billing })
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn BillingStore>> {
    match &config.database_url {
        #[cfg(feature = "database")]
        Some(url) => {
            let store = crate::billing::SeaOrmBillingStore::connect(url, 10).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "database"))]
        Some(_) => {
            tracing::warn!(
                "DATABASE_URL is set but the database feature is disabled, using in-memory store"
            );
            Ok(Arc::new(InMemoryBillingStore::new()))
        }
        None => {
            tracing::warn!("No DATABASE_URL configured, billing state will not survive restarts");
            Ok(Arc::new(InMemoryBillingStore::new()))
        }
    }
}

/// Builder for AppContext with fluent API
///
/// Starts from an in-memory store with no gateway configured, which is what
/// tests and local development want.
#[must_use = "builder does nothing until you call build()"]
pub struct AppContextBuilder {
    store: Option<Arc<dyn BillingStore>>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    notifier: Option<Arc<dyn crate::billing::Notifier>>,
    webhook_secret: Option<SecretString>,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            gateway: None,
            notifier: None,
            webhook_secret: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BillingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn crate::billing::Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn build(self) -> AppContext {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryBillingStore::new()));

        let mut builder = BillingServices::builder(store);
        if let Some(gateway) = self.gateway {
            builder = builder.gateway(gateway);
        }
        if let Some(notifier) = self.notifier {
            builder = builder.notifier(notifier);
        }
        if let Some(secret) = self.webhook_secret {
            builder = builder.webhook_secret(secret);
        }

        AppContext {
            billing: builder.build(),
        }
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

