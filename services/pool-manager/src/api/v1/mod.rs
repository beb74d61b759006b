//! API v1 routes.

mod allocations;
mod resources;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/allocations", allocations::routes())
        .nest("/resources", resources::routes())
}
