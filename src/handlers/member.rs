//! 成员角色与权限检查的 HTTP 处理器

use axum::{
    extract::{Path, Query, State},
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
    models::{AssignRoleRequest, ModulePermissions, PermissionCheckQuery},
};

const ADMIN_MODULE: &str = "admin";

/// 修改成员角色
pub async fn assign_member_role(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Path(user_id): Path<String>,
    Json(request): Json<AssignRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;
    require_module_permission(&registry, &auth, ADMIN_MODULE, "assign_roles").await?;

    registry.assign_member_role(&user_id, &request.role_id).await?;

    Ok(Json(json!({
        "club_id": registry.club_id(),
        "user_id": user_id,
        "role_id": request.role_id,
    })))
}

/// 权限检查
///
/// 未指定 role_id 时检查当前用户；检查其他角色需要 view_roles。
pub async fn check_permission(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
    Query(query): Query<PermissionCheckQuery>,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;

    let (role_id, allowed) = match query.role_id {
        Some(role_id) => {
            require_module_permission(&registry, &auth, ADMIN_MODULE, "view_roles").await?;
            let allowed = registry
                .has_permission(&role_id, &query.module_id, &query.permission_id)
                .await;
            (Some(role_id), allowed)
        }
        None => {
            let role_id = registry.member_role(&auth.user_id).await?;
            let allowed = match &role_id {
                Some(role_id) => {
                    registry
                        .has_permission(role_id, &query.module_id, &query.permission_id)
                        .await
                }
                None => false,
            };
            (role_id, allowed)
        }
    };

    Ok(Json(json!({
        "module_id": query.module_id,
        "permission_id": query.permission_id,
        "role_id": role_id,
        "allowed": allowed,
    })))
}

/// 当前用户在已启用模块上的全部权限（前端菜单用）
pub async fn my_permissions(
    State(state): State<Arc<AppState>>,
    auth: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let registry = club_registry(&state, &auth).await;

    let role_id = registry.member_role(&auth.user_id).await?;
    let permissions = match &role_id {
        Some(role_id) => registry.effective_permissions(role_id).await?,
        None => ModulePermissions::new(),
    };

    Ok(Json(json!({
        "user_id": auth.user_id,
        "club_id": registry.club_id(),
        "role_id": role_id,
        "permissions": permissions,
    })))
}
