use axum::Router;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use uuid::Uuid;

use crate::app::AppContext;

/// Stamps each request with a UUID v4 `x-request-id` unless the caller sent one.
#[derive(Clone, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let request_id = Uuid::new_v4().to_string().parse().ok()?;
        Some(RequestId::new(request_id))
    }
}

/// Set the request id on the way in and echo it on the way out, so a
/// gateway callback can be matched to its log lines.
///
/// The set layer is added last so it wraps the propagate layer and the id
/// exists before propagation looks for it.
pub fn with_request_id(router: Router<AppContext>) -> Router<AppContext> {
    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}
