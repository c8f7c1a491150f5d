//! Administrative HTTP interface.

mod error;
mod routes;
mod state;

pub use error::ApiError;
pub use state::AdminState;

use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the admin router.
pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .merge(routes::health())
        .nest("/v1", routes::v1())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
