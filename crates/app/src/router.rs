use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use lavapos_core::ncf::NcfAllocator;
use lavapos_storage::Database;

use crate::{ncf, orders, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    allocator: NcfAllocator,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, allocator: NcfAllocator) -> Self {
        Self {
            metrics,
            storage,
            allocator,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn allocator(&self) -> &NcfAllocator {
        &self.allocator
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/ncf/ranges", get(ncf::list_ranges).post(ncf::create_range))
        .route("/ncf/ranges/:id/activation", put(ncf::set_activation))
        .route("/ncf/config", get(ncf::get_config).put(ncf::put_config))
        .route("/ncf/allocate", post(ncf::allocate))
        .route("/orders", post(orders::create_order))
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/status", put(orders::update_status))
        .route("/orders/:id/deliver", post(orders::deliver))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::http::Method;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = setup_app().await;
        let response = send(&app.state, Method::GET, "/healthz", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = setup_app().await;
        let response = send(&app.state, Method::GET, "/metrics", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = setup_app().await;
        let response = send(&app.state, Method::GET, "/ncf/unknown", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
