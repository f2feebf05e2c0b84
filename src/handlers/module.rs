//! 俱乐部模块实例的 HTTP 处理器
//! 安装、卸载、启停与设置

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    auth::{require_module_permission, AuthContext},
    error::AppError,
    handlers::club_registry,
    middleware::AppState,
    models::{InstallModuleRequest, ListModulesQuery, UpdateSettingsRequest},
};

const ADMIN_MODULE: &str = "admin";

/// 列出已安装模块（`?active=true` 只看已启用）
pub async fn list_modules(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Query(query): Query<ListModulesQuery>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "view_modules").await?;

    let modules = if query.active.unwrap_or(false) {
        registry.list_active().await
    } else {
        registry.list_installed().await
    };

    Ok(Json(json!({
        "club_id": registry.club_id(),
        "modules": modules,
        "degraded": registry.is_degraded().await,
    })))
}

/// 获取单个已安装模块
pub async fn get_module(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "view_modules").await?;

    let instance = registry
        .get_instance(&module_id)
        .await
        .ok_or_else(|| AppError::not_found(&format!("module instance {}", module_id)))?;

    Ok(Json(instance))
}

/// 安装模块
///
/// 请求体可省略，省略时使用目录默认设置。
pub async fn install_module(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(module_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "install_modules").await?;

    let request: InstallModuleRequest = if body.is_empty() {
        InstallModuleRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };

    let instance = registry.install(&module_id, request.settings).await?;

    Ok((StatusCode::CREATED, Json(instance)))
}

/// 卸载模块（设置会先归档）
pub async fn uninstall_module(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "uninstall_modules").await?;

    let archived = registry.uninstall(&module_id).await?;

    Ok(Json(json!({
        "module_id": module_id,
        "uninstalled": true,
        "archived_documents": archived,
    })))
}

pub async fn enable_module(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "install_modules").await?;

    let changed = registry.enable(&module_id).await?;

    Ok(Json(json!({
        "module_id": module_id,
        "is_active": true,
        "changed": changed,
    })))
}

pub async fn disable_module(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "uninstall_modules").await?;

    let changed = registry.disable(&module_id).await?;

    Ok(Json(json!({
        "module_id": module_id,
        "is_active": false,
        "changed": changed,
    })))
}

/// 当前设置与当前生效的设置项定义
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(module_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "view_modules").await?;

    let settings = registry.settings(&module_id).await?;
    let applicable = registry.applicable_settings(&module_id).await?;

    Ok(Json(json!({
        "module_id": module_id,
        "settings": settings,
        "applicable": applicable,
    })))
}

/// 整体替换模块设置
pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(module_id): Path<String>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "configure_modules").await?;

    let instance = registry.update_settings(&module_id, request.settings).await?;

    Ok(Json(instance))
}
