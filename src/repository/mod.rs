//! 文档存储层
//!
//! `RegistryStore` 是注册表对外部文档数据库的唯一依赖。
//! 每个方法都是对单个逻辑文档组的原子读写；跨文档的不变量
//! （例如跨多个模块实例的依赖检查）不在存储层保证。

pub mod memory_store;
pub mod pg_store;

pub use memory_store::MemoryRegistryStore;
pub use pg_store::PgRegistryStore;

use crate::error::StoreError;
use crate::models::{ModularRole, ModuleDefinition, ModuleInstance};
use async_trait::async_trait;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait RegistryStore: Send + Sync {
    // ==================== Catalog ====================

    /// 读取已发布的模块目录（按发布顺序），未发布时返回空
    async fn load_catalog(&self) -> StoreResult<Vec<ModuleDefinition>>;

    /// 整体替换模块目录（单个原子批次）
    async fn replace_catalog(&self, modules: &[ModuleDefinition]) -> StoreResult<()>;

    // ==================== Module instances ====================

    async fn list_instances(&self, club_id: &str) -> StoreResult<Vec<ModuleInstance>>;

    /// 覆盖已存在实例（启停、设置变更）
    async fn put_instance(&self, instance: &ModuleInstance) -> StoreResult<()>;

    /// 写入新实例并创建模块数据命名空间（元数据文档），单个原子批次。
    /// 实例已存在时返回 `StoreError::Conflict`，不写入任何内容
    async fn insert_instance(&self, instance: &ModuleInstance) -> StoreResult<()>;

    /// 把模块业务数据移到归档区并删除实例，单个原子批次；返回归档的文档数
    async fn archive_and_remove_module(&self, club_id: &str, module_id: &str)
        -> StoreResult<u64>;

    // ==================== Roles ====================

    async fn list_roles(&self, club_id: &str) -> StoreResult<Vec<ModularRole>>;

    async fn put_role(&self, role: &ModularRole) -> StoreResult<()>;

    /// 批量写入新角色（单个原子批次）。
    /// 任一角色已存在时返回 `StoreError::Conflict`，整批不写入
    async fn insert_roles(&self, roles: &[ModularRole]) -> StoreResult<()>;

    async fn delete_role(&self, club_id: &str, role_id: &str) -> StoreResult<()>;

    // ==================== Members ====================

    async fn member_role(&self, club_id: &str, user_id: &str) -> StoreResult<Option<String>>;

    async fn set_member_role(&self, club_id: &str, user_id: &str, role_id: &str)
        -> StoreResult<()>;

    async fn count_members_with_role(&self, club_id: &str, role_id: &str) -> StoreResult<u64>;

    // ==================== Health ====================

    async fn health_check(&self) -> StoreResult<()>;
}
