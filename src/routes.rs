//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::{handlers, middleware::AppState};

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 需要认证的路由；俱乐部由令牌中的 club_id 决定
    let authenticated_routes = Router::new()
        // 模块目录
        .route("/api/v1/catalog", get(handlers::catalog::list_catalog))
        .route(
            "/api/v1/catalog/{module_id}",
            get(handlers::catalog::get_catalog_module),
        )

        // 模块实例
        .route("/api/v1/modules", get(handlers::module::list_modules))
        .route(
            "/api/v1/modules/{module_id}",
            get(handlers::module::get_module)
                .post(handlers::module::install_module)
                .delete(handlers::module::uninstall_module),
        )
        .route(
            "/api/v1/modules/{module_id}/enable",
            post(handlers::module::enable_module),
        )
        .route(
            "/api/v1/modules/{module_id}/disable",
            post(handlers::module::disable_module),
        )
        .route(
            "/api/v1/modules/{module_id}/settings",
            get(handlers::module::get_settings).put(handlers::module::update_settings),
        )

        // 角色
        .route(
            "/api/v1/roles",
            get(handlers::role::list_roles).post(handlers::role::create_role),
        )
        .route("/api/v1/roles/seed", post(handlers::role::seed_roles))
        .route(
            "/api/v1/roles/{role_id}",
            get(handlers::role::get_role)
                .patch(handlers::role::update_role)
                .delete(handlers::role::delete_role),
        )
        .route(
            "/api/v1/roles/{role_id}/modules/{module_id}/permissions",
            put(handlers::role::set_module_permissions),
        )
        .route(
            "/api/v1/roles/{role_id}/modules/{module_id}/permissions/{permission_id}",
            put(handlers::role::grant_permission).delete(handlers::role::revoke_permission),
        )

        // 成员与权限检查
        .route(
            "/api/v1/members/{user_id}/role",
            put(handlers::member::assign_member_role),
        )
        .route(
            "/api/v1/permissions/check",
            get(handlers::member::check_permission),
        )
        .route("/api/v1/permissions/me", get(handlers::member::my_permissions))
        .layer(axum::middleware::from_fn_with_state(
            state.jwt_service.clone(),
            crate::auth::jwt_auth_middleware,
        ));

    // 指标端点
    let metrics_routes = Router::new().route("/metrics", get(handlers::metrics::metrics_export));

    // 组合所有路由
    Router::new()
        .merge(public_routes)
        .merge(authenticated_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(
            state.config.server.request_body_limit_bytes,
        ))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(
            crate::middleware::request_tracking_middleware,
        ))
        .with_state(state)
}
