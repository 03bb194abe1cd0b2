use crate::pipeline::PipelineSupervisor;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(supervisor: Arc<PipelineSupervisor>) -> Router {
    Router::new()
        // 控制面
        .route("/api/v1/health", get(super::handlers::health))
        .route("/api/v1/stats", get(super::handlers::stats))
        .route("/api/v1/source/start", post(super::handlers::start_source))
        .route("/api/v1/source/stop", post(super::handlers::stop_source))
        .route("/api/v1/source/test", post(super::handlers::probe_source))
        .route("/api/v1/devices", get(super::handlers::list_devices))
        // 检测流
        .route("/ws/video", get(super::ws::video_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(supervisor)
}
