//! 测试公共模块
//! 提供测试辅助函数和测试工具

#![allow(dead_code)]

use axum::{body::Body, http::Request, response::Response};
use calycompta_registry::{
    auth::JwtService,
    config::{
        AppConfig, DatabaseConfig, LoggingConfig, RegistryConfig, SecurityConfig, ServerConfig,
        StoreBackend,
    },
    middleware::AppState,
    repository::{MemoryRegistryStore, RegistryStore},
    routes,
    services::{default_sources, RegistryHub, RegistryService, SettingValidators, StaticIdentity},
};
use http_body_util::BodyExt;
use secrecy::Secret;
use std::sync::Arc;
use tower::ServiceExt;

pub const TEST_JWT_SECRET: &str = "test-secret-key-for-testing-only-min-32-chars";
pub const TEST_CLUB: &str = "calypso";

/// 创建测试配置（内存存储）
pub fn create_test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(), // 使用随机端口
            graceful_shutdown_timeout_secs: 5,
            request_body_limit_bytes: 64 * 1024,
        },
        database: DatabaseConfig {
            url: None,
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 5,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: "pretty".to_string(),
        },
        security: SecurityConfig {
            jwt_secret: Secret::new(TEST_JWT_SECRET.to_string()),
            access_token_exp_secs: 300, // 5分钟用于测试
        },
        registry: RegistryConfig {
            store: StoreBackend::Memory,
            catalog_file: None,
            preload_clubs: Vec::new(),
        },
    }
}

/// 以指定操作者初始化一个俱乐部注册表
pub async fn create_test_registry(
    club_id: &str,
    actor: &str,
) -> (Arc<MemoryRegistryStore>, RegistryService) {
    let store = Arc::new(MemoryRegistryStore::new());
    let registry = registry_over(store.clone(), club_id, actor).await;
    (store, registry)
}

/// 在已有存储上重新初始化注册表（模拟进程重启）
pub async fn registry_over(
    store: Arc<MemoryRegistryStore>,
    club_id: &str,
    actor: &str,
) -> RegistryService {
    let sources = default_sources(store.clone() as Arc<dyn RegistryStore>, None);
    RegistryService::initialize(
        club_id,
        store,
        sources,
        Arc::new(StaticIdentity::new(actor)),
    )
    .await
}

/// 创建测试应用状态
pub async fn create_test_app_state() -> (Arc<MemoryRegistryStore>, Arc<AppState>) {
    let config = create_test_config();
    let store = Arc::new(MemoryRegistryStore::new());
    let sources = default_sources(store.clone() as Arc<dyn RegistryStore>, None);
    let hub = Arc::new(
        RegistryHub::new(store.clone(), sources, SettingValidators::with_builtins()).await,
    );
    let jwt_service =
        Arc::new(JwtService::from_config(&config).expect("Failed to create JWT service"));

    (store, Arc::new(AppState::new(config, hub, jwt_service)))
}

/// 签发测试访问令牌
pub fn issue_token(state: &AppState, user_id: &str, club_id: &str, roles: &[&str]) -> String {
    state
        .jwt_service
        .generate_access_token(
            user_id,
            club_id,
            roles.iter().map(|r| r.to_string()).collect(),
        )
        .expect("Failed to issue token")
}

/// 平台超级管理员令牌
pub fn platform_admin_token(state: &AppState) -> String {
    issue_token(state, "platform-admin", TEST_CLUB, &["superadmin"])
}

/// 发送请求
pub async fn send(
    state: Arc<AppState>,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }

    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    routes::create_router(state).oneshot(request).await.unwrap()
}

/// 读取 JSON 响应体
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
