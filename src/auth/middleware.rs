//! JWT 认证中间件与模块权限守卫

use crate::{
    auth::jwt::JwtService,
    error::AppError,
    models::SystemRole,
    services::{IdentityProvider, RegistryService},
};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// 认证上下文（附加到请求扩展）
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub club_id: String,
    /// 身份提供方授予的平台角色
    pub roles: Vec<String>,
}

impl AuthContext {
    /// 平台级超级管理员（不依赖俱乐部内的角色）
    pub fn is_platform_superadmin(&self) -> bool {
        self.roles.iter().any(|r| r == SystemRole::Superadmin.id())
    }
}

impl IdentityProvider for AuthContext {
    fn actor_id(&self) -> String {
        self.user_id.clone()
    }
}

// 实现 FromRequestParts 以便在 handler 中直接提取 AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// 从 Authorization 头提取令牌
pub fn extract_token(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or(AppError::Unauthorized)
}

/// JWT 认证中间件 - 必须认证
pub async fn jwt_auth_middleware(
    State(jwt_service): State<Arc<JwtService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_token(req.headers())?;
    let claims = jwt_service.validate_access_token(&token)?;

    let auth_context = AuthContext {
        user_id: claims.sub,
        club_id: claims.club_id,
        roles: claims.roles,
    };

    req.extensions_mut().insert(auth_context);

    Ok(next.run(req).await)
}

/// 要求调用者在俱乐部注册表中持有模块权限
///
/// 平台超级管理员与持有 superadmin 系统角色的成员始终放行，
/// 用于俱乐部尚未配置任何授权时的初始化。
pub async fn require_module_permission(
    registry: &RegistryService,
    auth: &AuthContext,
    module_id: &str,
    permission_id: &str,
) -> Result<(), AppError> {
    if auth.is_platform_superadmin() {
        return Ok(());
    }

    let member_role = registry.member_role(&auth.user_id).await?;
    if member_role.as_deref() == Some(SystemRole::Superadmin.id()) {
        return Ok(());
    }

    if let Some(role_id) = member_role {
        if registry.has_permission(&role_id, module_id, permission_id).await {
            return Ok(());
        }
    }

    tracing::warn!(
        user_id = %auth.user_id,
        club_id = %auth.club_id,
        module_id,
        permission_id,
        "Permission denied"
    );
    Err(AppError::Forbidden)
}
