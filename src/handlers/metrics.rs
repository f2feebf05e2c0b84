//! 指标处理器
//! 提供 /metrics 端点

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::AppState;

/// 注册表运行状态
#[derive(Serialize)]
pub struct MetricsResponse {
    pub loaded_clubs: usize,
    pub catalog_version: String,
    pub catalog_source: String,
    pub catalog_modules: usize,
    pub catalog_degraded: bool,
    pub process_uptime_secs: u64,
}

/// 指标暴露端点
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    let catalog = state.hub.catalog().await;

    Json(MetricsResponse {
        loaded_clubs: state.hub.loaded_clubs(),
        catalog_version: catalog.version(),
        catalog_source: catalog.source().to_string(),
        catalog_modules: catalog.len(),
        catalog_degraded: catalog.is_degraded(),
        process_uptime_secs: state.uptime_secs(),
    })
}
