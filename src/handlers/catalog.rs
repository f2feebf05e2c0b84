//! 模块目录的 HTTP 处理器

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::{
    auth::AuthContext,
    error::{AppError, RegistryError},
    middleware::AppState,
    models::ModuleDefinition,
};

#[derive(Serialize)]
pub struct CatalogResponse {
    pub version: String,
    pub source: String,
    pub modules: Vec<ModuleDefinition>,
}

/// 列出目录（声明顺序）
pub async fn list_catalog(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let catalog = state.hub.catalog().await;

    Ok(Json(CatalogResponse {
        version: catalog.version(),
        source: catalog.source().to_string(),
        modules: catalog.list_all().to_vec(),
    }))
}

/// 获取单个模块定义
pub async fn get_catalog_module(
    State(state): State<Arc<AppState>>,
    _auth: AuthContext,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let catalog = state.hub.catalog().await;
    let module = catalog
        .get(&module_id)
        .cloned()
        .ok_or(RegistryError::UnknownModule(module_id))?;

    Ok(Json(module))
}
