use crate::pipeline::{PipelineError, PipelineState, PipelineSupervisor};
use crate::source::{DeviceInfo, SourceError};
use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use common::{ProbeResponse, StartSourceRequest, StartSourceResponse, StatsSnapshot, StopResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type AppState = Arc<PipelineSupervisor>;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn map_pipeline_error(error: PipelineError) -> ApiError {
    let status = match &error {
        PipelineError::Source(e) => match e {
            SourceError::InvalidLocator(_) => StatusCode::BAD_REQUEST,
            SourceError::NotFound(_) => StatusCode::NOT_FOUND,
            SourceError::Unreachable(_) | SourceError::TransportNegotiation(_) => {
                StatusCode::BAD_GATEWAY
            }
            SourceError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        PipelineError::OpenTimeout => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::InvalidParameter(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(ApiResponse::<()>::error(error.to_string())))
}

#[derive(Serialize)]
pub struct HealthInfo {
    pub state: PipelineState,
    pub version: &'static str,
}

/// 健康检查
pub async fn health(State(supervisor): State<AppState>) -> Json<ApiResponse<HealthInfo>> {
    Json(ApiResponse::success(HealthInfo {
        state: supervisor.state(),
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// 聚合统计
pub async fn stats(State(supervisor): State<AppState>) -> Json<ApiResponse<StatsSnapshot>> {
    Json(ApiResponse::success(supervisor.stats().await))
}

/// 启动检测源（已有活动流时隐式停止）
pub async fn start_source(
    State(supervisor): State<AppState>,
    Json(request): Json<StartSourceRequest>,
) -> Result<Json<ApiResponse<StartSourceResponse>>, ApiError> {
    let response = supervisor
        .start(request.descriptor)
        .await
        .map_err(map_pipeline_error)?;
    Ok(Json(ApiResponse::success(response)))
}

/// 停止当前检测源（幂等）
pub async fn stop_source(
    State(supervisor): State<AppState>,
) -> Result<Json<ApiResponse<StopResponse>>, ApiError> {
    let response = supervisor.stop().await.map_err(map_pipeline_error)?;
    Ok(Json(ApiResponse::success(response)))
}

#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    pub url: String,
}

/// RTSP连通性探测（不影响活动流）
pub async fn probe_source(
    State(supervisor): State<AppState>,
    Json(request): Json<ProbeRequest>,
) -> Json<ApiResponse<ProbeResponse>> {
    Json(ApiResponse::success(supervisor.probe(&request.url).await))
}

/// 枚举本机采集设备
pub async fn list_devices(
    State(supervisor): State<AppState>,
) -> Json<ApiResponse<Vec<DeviceInfo>>> {
    Json(ApiResponse::success(supervisor.devices()))
}
