use axum::Router;

use crate::app::AppContext;

/// A group of routes mounted together.
///
/// Routers are returned without state; [`App`](crate::App) supplies the
/// [`AppContext`] once every module is registered, and handlers read it with
/// `State<AppContext>`.
///
/// ```ignore
/// struct ReportsModule;
///
/// impl RouteModule for ReportsModule {
///     fn routes(&self) -> Router<AppContext> {
///         Router::new().route("/reports/daily", get(daily_report))
///     }
///
///     fn prefix(&self) -> Option<&str> {
///         Some("/admin")
///     }
/// }
/// ```
pub trait RouteModule {
    fn routes(&self) -> Router<AppContext>;

    /// Mount point; `None` merges the routes at the root.
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Add this module's routes to `router`.
    fn register(self, router: Router<AppContext>) -> Router<AppContext>
    where
        Self: Sized,
    {
        let routes = self.routes();
        match self.prefix() {
            Some(prefix) => router.nest(prefix, routes),
            None => router.merge(routes),
        }
    }
}
