//! The axum HTTP surface: proxy routes plus observability routes.

pub mod observability;
pub mod proxy;

use std::sync::Arc;

use axum::Router;
use tianji_core::AppState;

pub fn app_router(state: Arc<AppState>) -> Router {
    proxy::proxy_router(state.clone()).merge(observability::observability_router(state))
}
