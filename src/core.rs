use crate::{
    app::AppContext,
    config::Config,
    health,
    http::{AdminSettingsModule, PaymentsModule, RouteModule},
    middleware,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Main application structure for Tollgate
pub struct App {
    router: Router<AppContext>,
    config: Config,
    context: AppContext,
    /// Run the pending-transaction sweep alongside the server
    sweep_enabled: bool,
}

impl App {
    /// Creates a new App with default configuration and an in-memory store
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a new App with the provided configuration
    ///
    /// The context starts as an in-memory one; swap it with
    /// [`with_context`](Self::with_context) or build the app with
    /// [`from_config`](Self::from_config) instead.
    pub fn with_config(config: Config) -> Self {
        Self {
            router: Self::build_router(),
            config,
            context: AppContext::builder().build(),
            sweep_enabled: true,
        }
    }

    /// Wire storage and gateway from `config` and register every billing route.
    pub async fn from_config(config: Config) -> crate::error::Result<Self> {
        let context = AppContext::from_config(&config).await?;
        Ok(Self::with_config(config)
            .with_context(context)
            .register_module(PaymentsModule)
            .register_module(AdminSettingsModule))
    }

    /// Builder pattern for constructing an App
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    fn build_router() -> Router<AppContext> {
        health::health_routes()
    }

    /// Register a route module with the application
    ///
    /// Note: The module's router will inherit the AppContext state from the parent router.
    /// Handlers should use `State<AppContext>` to access the application context.
    pub fn register_module<M: RouteModule>(mut self, module: M) -> Self {
        self.router = module.register(self.router);
        self
    }

    /// Set the application context
    pub fn with_context(mut self, context: AppContext) -> Self {
        self.context = context;
        self
    }

    /// Disable the background sweep (e.g. when another replica runs it)
    pub fn without_sweep(mut self) -> Self {
        self.sweep_enabled = false;
        self
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Get the router for testing purposes
    ///
    /// Middleware is applied and the AppContext state provided, so the
    /// router can be driven directly with `tower::ServiceExt::oneshot`.
    pub fn into_test_router(self) -> Router {
        let app = self.with_middleware();
        app.router.with_state(app.context)
    }

    /// Apply middleware stack and prepare for serving
    fn with_middleware(mut self) -> Self {
        let mut router = self.router;

        // 1. Body size limit - reject large bodies early
        router = router.layer(DefaultBodyLimit::max(self.config.server.max_body_size));

        // 2. Request ID - add request IDs for tracing
        router = middleware::with_request_id(router);

        // 3. Trace layer - HTTP tracing
        router = router.layer(TraceLayer::new_for_http());

        self.router = router;
        self
    }

    /// Start the application server
    ///
    /// Runs until Ctrl+C or SIGTERM, then stops accepting connections and
    /// lets the sweep finish its current pass.
    pub async fn serve(self) -> Result<(), std::io::Error> {
        let addr = self
            .config
            .server
            .addr()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let sweep_enabled = self.sweep_enabled;
        let app = self.with_middleware();

        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Server starting on http://{}", addr);
        tracing::info!("Health check available at http://{}/health", addr);

        let sweep = sweep_enabled.then(|| app.context.billing.sweeper.clone().spawn());

        // Router<AppContext> means "a router missing AppContext state"
        // Call with_state to transition Router<AppContext> -> Router<()>
        let final_router = app.router.with_state(app.context);

        let result = axum::serve(listener, final_router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        if let Some(sweep) = sweep {
            sweep.shutdown().await;
        }
        tracing::info!("Shutdown complete");

        result
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for App with fluent API
#[must_use = "builder does nothing until you call build()"]
pub struct AppBuilder {
    config: Config,
    context: Option<AppContext>,
    modules: Vec<Box<dyn FnOnce(Router<AppContext>) -> Router<AppContext> + Send>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            context: None,
            modules: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_context(mut self, context: AppContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn register_module<M: RouteModule + Send + 'static>(mut self, module: M) -> Self {
        self.modules
            .push(Box::new(move |router| module.register(router)));
        self
    }

    /// Register the payment and admin routes.
    pub fn with_billing_routes(self) -> Self {
        self.register_module(PaymentsModule)
            .register_module(AdminSettingsModule)
    }

    pub fn build(self) -> App {
        let mut app = App::with_config(self.config);
        if let Some(context) = self.context {
            app.context = context;
        }

        for register in self.modules {
            app.router = register(app.router);
        }

        app
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give connections a grace period to close
    tokio::time::sleep(Duration::from_secs(1)).await;
}
