//! 角色管理的 HTTP 处理器

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

use crate::{
    auth::{require_module_permission, AuthContext},
    error::AppError,
    handlers::club_registry,
    middleware::AppState,
    models::{CreateRoleRequest, RolePatch, SetPermissionsRequest},
};

const ADMIN_MODULE: &str = "admin";

pub async fn list_roles(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "view_roles").await?;

    let roles = registry.list_roles().await;

    Ok(Json(json!({
        "club_id": registry.club_id(),
        "roles": roles,
    })))
}

/// 获取角色及其当前生效的权限
pub async fn get_role(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(role_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "view_roles").await?;

    let role = registry.get_role(&role_id).await?;
    let effective = registry.effective_permissions(&role_id).await?;

    Ok(Json(json!({
        "role": role,
        "effective_permissions": effective,
    })))
}

pub async fn create_role(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Json(request): Json<CreateRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    request.validate()?;

    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "manage_roles").await?;

    let role = registry.create_role(request).await?;

    Ok((StatusCode::CREATED, Json(role)))
}

/// 写入默认系统角色阶梯
pub async fn seed_roles(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "manage_roles").await?;

    let roles = registry.seed_default_roles().await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "club_id": registry.club_id(),
            "roles": roles,
        })),
    ))
}

pub async fn update_role(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(role_id): Path<String>,
    Json(patch): Json<RolePatch>,
) -> Result<impl IntoResponse, AppError> {
    patch.validate()?;

    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "manage_roles").await?;

    let role = registry.update_role(&role_id, patch).await?;

    Ok(Json(role))
}

pub async fn delete_role(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(role_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "manage_roles").await?;

    registry.delete_role(&role_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// 替换角色在某个模块上的全部授权
pub async fn set_module_permissions(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((role_id, module_id)): Path<(String, String)>,
    Json(request): Json<SetPermissionsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "manage_roles").await?;

    let role = registry
        .set_module_permissions(&role_id, &module_id, request.permissions)
        .await?;

    Ok(Json(role))
}

pub async fn grant_permission(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((role_id, module_id, permission_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "manage_roles").await?;

    let changed = registry
        .grant_permission(&role_id, &module_id, &permission_id)
        .await?;

    Ok(Json(json!({
        "role_id": role_id,
        "module_id": module_id,
        "permission_id": permission_id,
        "granted": true,
        "changed": changed,
    })))
}

pub async fn revoke_permission(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path((role_id, module_id, permission_id)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "manage_roles").await?;

    let changed = registry
        .revoke_permission(&role_id, &module_id, &permission_id)
        .await?;

    Ok(Json(json!({
        "role_id": role_id,
        "module_id": module_id,
        "permission_id": permission_id,
        "granted": false,
        "changed": changed,
    })))
}
