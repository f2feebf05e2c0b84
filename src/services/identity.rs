//! 当前操作者
//!
//! 注册表不自己做认证，只从注入的 `IdentityProvider` 读取操作者 id，
//! 用于给每次变更盖上操作者与时间戳。

use chrono::{DateTime, Utc};

/// 当前已认证身份
pub trait IdentityProvider: Send + Sync {
    /// 操作者 id
    fn actor_id(&self) -> String;
}

/// 固定身份（后台任务、命令行、测试）
#[derive(Debug, Clone)]
pub struct StaticIdentity(String);

impl StaticIdentity {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self(actor_id.into())
    }

    /// 服务自身发起的变更
    pub fn system() -> Self {
        Self::new("system")
    }
}

impl IdentityProvider for StaticIdentity {
    fn actor_id(&self) -> String {
        self.0.clone()
    }
}

/// 变更的操作者与服务端时间
#[derive(Debug, Clone)]
pub struct Stamp {
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl Stamp {
    pub fn now(identity: &dyn IdentityProvider) -> Self {
        Self {
            actor: identity.actor_id(),
            at: Utc::now(),
        }
    }
}
