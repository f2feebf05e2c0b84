//! HTTP 处理器模块

pub mod catalog;
pub mod health;
pub mod member;
pub mod metrics;
pub mod module;
pub mod role;

use std::sync::Arc;

use crate::{auth::AuthContext, middleware::AppState, services::RegistryService};

/// 调用者所在俱乐部的注册表，以调用者身份执行变更
pub(crate) async fn club_registry(state: &AppState, auth: &AuthContext) -> RegistryService {
    state
        .hub
        .registry(&auth.club_id)
        .await
        .acting_as(Arc::new(auth.clone()))
}
