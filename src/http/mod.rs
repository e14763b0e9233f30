//! HTTP surface.
//!
//! Handlers are grouped into [`RouteModule`]s and receive the shared
//! [`AppContext`](crate::AppContext) through axum state.

pub mod admin;
pub mod payments;
pub mod routes;

pub use admin::AdminSettingsModule;
pub use payments::PaymentsModule;
pub use routes::RouteModule;
