//! 注册表服务
//!
//! 组合模块目录、模块实例表与角色注册表，是外部调用方唯一依赖的入口。
//! 每次变更都盖上操作者与服务端时间；写存储期间持有俱乐部写锁，
//! 存储写入成功后才更新缓存（write-through）。

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{info, instrument, warn};

use crate::error::{RegistryError, StoreError};
use crate::models::{
    CreateRoleRequest, ModularRole, ModuleInstance, ModulePermissions, PermissionId, RoleId,
    RolePatch, SettingDefinition, SettingsMap,
};
use crate::repository::RegistryStore;
use crate::services::catalog::{CatalogSources, ModuleCatalog};
use crate::services::identity::{IdentityProvider, Stamp, StaticIdentity};
use crate::services::instance_store::{ModuleInstanceStore, MutationContext};
use crate::services::role_registry::RoleRegistry;
use crate::services::settings::SettingValidators;

/// 可整体替换的共享目录
pub type SharedCatalog = Arc<RwLock<Arc<ModuleCatalog>>>;

struct ClubState {
    instances: ModuleInstanceStore,
    roles: RoleRegistry,
}

impl ClubState {
    async fn load(club_id: &str, store: &dyn RegistryStore) -> Result<Self, StoreError> {
        Ok(Self {
            instances: ModuleInstanceStore::load(club_id, store).await?,
            roles: RoleRegistry::load(club_id, store).await?,
        })
    }
}

fn record<T>(operation: &'static str, result: &Result<T, RegistryError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    metrics::counter!("registry_mutations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

async fn load_catalog_or_degraded(sources: &CatalogSources) -> ModuleCatalog {
    match ModuleCatalog::load(sources).await {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!(error = %e, "Module catalog unavailable, continuing with an empty catalog");
            ModuleCatalog::degraded()
        }
    }
}

/// 单个俱乐部的注册表服务
///
/// Clone 共享同一份缓存；`acting_as` 返回换了操作者的句柄。
#[derive(Clone)]
pub struct RegistryService {
    club_id: String,
    catalog: SharedCatalog,
    sources: CatalogSources,
    state: Arc<RwLock<ClubState>>,
    store: Arc<dyn RegistryStore>,
    identity: Arc<dyn IdentityProvider>,
    validators: Arc<SettingValidators>,
    state_degraded: Arc<AtomicBool>,
}

impl RegistryService {
    /// 加载目录、模块实例与角色
    ///
    /// 任何加载失败都只记录警告并以空状态继续（降级模式），见 `is_degraded`。
    pub async fn initialize(
        club_id: &str,
        store: Arc<dyn RegistryStore>,
        sources: CatalogSources,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let catalog = load_catalog_or_degraded(&sources).await;
        Self::attach(
            club_id,
            Arc::new(RwLock::new(Arc::new(catalog))),
            sources,
            store,
            identity,
            Arc::new(SettingValidators::with_builtins()),
        )
        .await
    }

    /// 使用已加载的共享目录，只加载俱乐部状态
    async fn attach(
        club_id: &str,
        catalog: SharedCatalog,
        sources: CatalogSources,
        store: Arc<dyn RegistryStore>,
        identity: Arc<dyn IdentityProvider>,
        validators: Arc<SettingValidators>,
    ) -> Self {
        let mut degraded = false;

        let instances = match ModuleInstanceStore::load(club_id, store.as_ref()).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(club_id, error = %e, "Failed to load module instances, starting empty");
                degraded = true;
                ModuleInstanceStore::new(club_id)
            }
        };

        let roles = match RoleRegistry::load(club_id, store.as_ref()).await {
            Ok(roles) => roles,
            Err(e) => {
                warn!(club_id, error = %e, "Failed to load roles, starting empty");
                degraded = true;
                RoleRegistry::new(club_id)
            }
        };

        info!(
            club_id,
            installed = instances.list_installed().len(),
            roles = roles.list().len(),
            degraded,
            "Registry initialized"
        );

        Self {
            club_id: club_id.to_string(),
            catalog,
            sources,
            state: Arc::new(RwLock::new(ClubState { instances, roles })),
            store,
            identity,
            validators,
            state_degraded: Arc::new(AtomicBool::new(degraded)),
        }
    }

    /// 替换自定义设置校验器
    pub fn with_validators(mut self, validators: SettingValidators) -> Self {
        self.validators = Arc::new(validators);
        self
    }

    /// 共享缓存、换一个操作者
    pub fn acting_as(&self, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    pub fn club_id(&self) -> &str {
        &self.club_id
    }

    pub fn actor_id(&self) -> String {
        self.identity.actor_id()
    }

    /// 目录或俱乐部状态是否加载失败
    pub async fn is_degraded(&self) -> bool {
        self.catalog().await.is_degraded() || self.state_degraded.load(Ordering::SeqCst)
    }

    /// 俱乐部状态加载失败过时重新加载；返回状态是否可用
    pub async fn recover(&self) -> bool {
        if !self.state_degraded.load(Ordering::SeqCst) {
            return true;
        }
        match self.writable_state().await {
            Ok(_) => true,
            Err(e) => {
                warn!(club_id = %self.club_id, error = %e, "Club state still unavailable");
                false
            }
        }
    }

    /// 变更用的写锁
    ///
    /// 降级状态下的缓存是空的，不能作为变更依据：先重新加载，
    /// 存储仍不可达时拒绝变更。
    async fn writable_state(&self) -> Result<RwLockWriteGuard<'_, ClubState>, RegistryError> {
        let mut state = self.state.write().await;
        if self.state_degraded.load(Ordering::SeqCst) {
            *state = ClubState::load(&self.club_id, self.store.as_ref()).await?;
            self.state_degraded.store(false, Ordering::SeqCst);
            info!(
                club_id = %self.club_id,
                installed = state.instances.list_installed().len(),
                roles = state.roles.list().len(),
                "Club state recovered"
            );
        }
        Ok(state)
    }

    fn context<'a>(&'a self, catalog: &'a ModuleCatalog) -> MutationContext<'a> {
        MutationContext {
            catalog,
            store: self.store.as_ref(),
            validators: self.validators.as_ref(),
            stamp: Stamp::now(self.identity.as_ref()),
        }
    }

    // ==================== Catalog ====================

    pub async fn catalog(&self) -> Arc<ModuleCatalog> {
        self.catalog.read().await.clone()
    }

    /// 重新加载目录并整体替换
    #[instrument(skip(self), fields(club_id = %self.club_id))]
    pub async fn reload_catalog(&self) -> Result<Arc<ModuleCatalog>, RegistryError> {
        let result = ModuleCatalog::load(&self.sources)
            .await
            .map(Arc::new)
            .map_err(RegistryError::from);

        if let Ok(catalog) = &result {
            *self.catalog.write().await = catalog.clone();
        }

        record("reload_catalog", &result);
        result
    }

    // ==================== Module instances ====================

    pub async fn get_instance(&self, module_id: &str) -> Option<ModuleInstance> {
        self.state.read().await.instances.get(module_id).cloned()
    }

    pub async fn list_installed(&self) -> Vec<ModuleInstance> {
        let state = self.state.read().await;
        state.instances.list_installed().into_iter().cloned().collect()
    }

    pub async fn list_active(&self) -> Vec<ModuleInstance> {
        let state = self.state.read().await;
        state.instances.list_active().into_iter().cloned().collect()
    }

    pub async fn is_installed(&self, module_id: &str) -> bool {
        self.state.read().await.instances.is_installed(module_id)
    }

    pub async fn is_active(&self, module_id: &str) -> bool {
        self.state.read().await.instances.is_active(module_id)
    }

    pub async fn settings(&self, module_id: &str) -> Result<SettingsMap, RegistryError> {
        self.state.read().await.instances.settings(module_id).cloned()
    }

    pub async fn applicable_settings(
        &self,
        module_id: &str,
    ) -> Result<Vec<SettingDefinition>, RegistryError> {
        let catalog = self.catalog().await;
        let state = self.state.read().await;
        let definitions = state.instances.applicable_settings(&catalog, module_id)?;
        Ok(definitions.into_iter().cloned().collect())
    }

    pub async fn install(
        &self,
        module_id: &str,
        initial_settings: Option<SettingsMap>,
    ) -> Result<ModuleInstance, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.instances.install(&self.context(&catalog), module_id, initial_settings).await
        }
        .await;
        record("install", &result);
        result
    }

    pub async fn uninstall(&self, module_id: &str) -> Result<u64, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.instances.uninstall(&self.context(&catalog), module_id).await
        }
        .await;
        record("uninstall", &result);
        result
    }

    pub async fn enable(&self, module_id: &str) -> Result<bool, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.instances.enable(&self.context(&catalog), module_id).await
        }
        .await;
        record("enable", &result);
        result
    }

    pub async fn disable(&self, module_id: &str) -> Result<bool, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.instances.disable(&self.context(&catalog), module_id).await
        }
        .await;
        record("disable", &result);
        result
    }

    pub async fn update_settings(
        &self,
        module_id: &str,
        settings: SettingsMap,
    ) -> Result<ModuleInstance, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.instances.update_settings(&self.context(&catalog), module_id, settings).await
        }
        .await;
        record("update_settings", &result);
        result
    }

    // ==================== Roles ====================

    pub async fn get_role(&self, role_id: &str) -> Result<ModularRole, RegistryError> {
        self.state
            .read()
            .await
            .roles
            .get(role_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownRole(role_id.to_string()))
    }

    /// 按层级从高到低
    pub async fn list_roles(&self) -> Vec<ModularRole> {
        let state = self.state.read().await;
        state.roles.list().into_iter().cloned().collect()
    }

    pub async fn seed_default_roles(&self) -> Result<Vec<ModularRole>, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.roles.seed_defaults(&self.context(&catalog)).await
        }
        .await;
        record("seed_roles", &result);
        result
    }

    pub async fn create_role(&self, request: CreateRoleRequest) -> Result<ModularRole, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.roles.create(&self.context(&catalog), request).await
        }
        .await;
        record("create_role", &result);
        result
    }

    pub async fn update_role(
        &self,
        role_id: &str,
        patch: RolePatch,
    ) -> Result<ModularRole, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.roles.update(&self.context(&catalog), role_id, patch).await
        }
        .await;
        record("update_role", &result);
        result
    }

    pub async fn delete_role(&self, role_id: &str) -> Result<(), RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state.roles.delete(&self.context(&catalog), role_id).await
        }
        .await;
        record("delete_role", &result);
        result
    }

    pub async fn grant_permission(
        &self,
        role_id: &str,
        module_id: &str,
        permission_id: &str,
    ) -> Result<bool, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state
                .roles
                .grant_permission(&self.context(&catalog), role_id, module_id, permission_id)
                .await
        }
        .await;
        record("grant_permission", &result);
        result
    }

    pub async fn revoke_permission(
        &self,
        role_id: &str,
        module_id: &str,
        permission_id: &str,
    ) -> Result<bool, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state
                .roles
                .revoke_permission(&self.context(&catalog), role_id, module_id, permission_id)
                .await
        }
        .await;
        record("revoke_permission", &result);
        result
    }

    pub async fn set_module_permissions(
        &self,
        role_id: &str,
        module_id: &str,
        permissions: BTreeSet<PermissionId>,
    ) -> Result<ModularRole, RegistryError> {
        let catalog = self.catalog().await;
        let result = async {
            let mut state = self.writable_state().await?;
            state
                .roles
                .set_module_permissions(&self.context(&catalog), role_id, module_id, permissions)
                .await
        }
        .await;
        record("set_module_permissions", &result);
        result
    }

    // ==================== Permission checks ====================

    /// 角色是否在已启用模块上持有权限
    pub async fn has_permission(&self, role_id: &str, module_id: &str, permission_id: &str) -> bool {
        let state = self.state.read().await;
        let allowed = state
            .roles
            .has_permission(&state.instances, role_id, module_id, permission_id);

        metrics::counter!(
            "registry_permission_checks_total",
            "decision" => if allowed { "allow" } else { "deny" }
        )
        .increment(1);
        allowed
    }

    /// 按成员当前角色判断；不是俱乐部成员时返回 false
    pub async fn user_has_permission(
        &self,
        user_id: &str,
        module_id: &str,
        permission_id: &str,
    ) -> Result<bool, RegistryError> {
        match self.member_role(user_id).await? {
            Some(role_id) => Ok(self.has_permission(&role_id, module_id, permission_id).await),
            None => Ok(false),
        }
    }

    pub async fn effective_permissions(
        &self,
        role_id: &str,
    ) -> Result<ModulePermissions, RegistryError> {
        let state = self.state.read().await;
        state.roles.effective_permissions(&state.instances, role_id)
    }

    // ==================== Members ====================

    pub async fn member_role(&self, user_id: &str) -> Result<Option<RoleId>, RegistryError> {
        Ok(self.store.member_role(&self.club_id, user_id).await?)
    }

    /// 修改成员角色（角色必须存在）
    #[instrument(skip(self), fields(club_id = %self.club_id))]
    pub async fn assign_member_role(&self, user_id: &str, role_id: &str) -> Result<(), RegistryError> {
        let result = async {
            let state = self.writable_state().await?;
            if state.roles.get(role_id).is_none() {
                return Err(RegistryError::UnknownRole(role_id.to_string()));
            }
            self.store
                .set_member_role(&self.club_id, user_id, role_id)
                .await
                .map_err(RegistryError::from)
        }
        .await;

        if result.is_ok() {
            info!(user_id, role_id, actor = %self.actor_id(), "Member role assigned");
        }
        record("assign_member_role", &result);
        result
    }
}

/// 多俱乐部注册表
///
/// 所有俱乐部共享一份目录与存储，俱乐部服务在第一次使用时初始化。
pub struct RegistryHub {
    store: Arc<dyn RegistryStore>,
    sources: CatalogSources,
    catalog: SharedCatalog,
    validators: Arc<SettingValidators>,
    clubs: DashMap<String, RegistryService>,
}

impl RegistryHub {
    /// 加载目录；失败时以空目录启动
    pub async fn new(
        store: Arc<dyn RegistryStore>,
        sources: CatalogSources,
        validators: SettingValidators,
    ) -> Self {
        let catalog = load_catalog_or_degraded(&sources).await;
        Self {
            store,
            sources,
            catalog: Arc::new(RwLock::new(Arc::new(catalog))),
            validators: Arc::new(validators),
            clubs: DashMap::new(),
        }
    }

    /// 俱乐部的注册表服务（以系统身份操作，请求中用 `acting_as` 切换）
    ///
    /// 缓存中的服务若处于降级状态，先尝试从存储恢复。
    pub async fn registry(&self, club_id: &str) -> RegistryService {
        let cached = self.clubs.get(club_id).map(|service| service.clone());
        if let Some(service) = cached {
            service.recover().await;
            return service;
        }

        let service = RegistryService::attach(
            club_id,
            self.catalog.clone(),
            self.sources.clone(),
            self.store.clone(),
            Arc::new(StaticIdentity::system()),
            self.validators.clone(),
        )
        .await;

        // 并发初始化时保留先插入的那份
        self.clubs
            .entry(club_id.to_string())
            .or_insert(service)
            .clone()
    }

    /// 丢弃俱乐部缓存，下次使用时重新加载
    pub fn evict(&self, club_id: &str) -> bool {
        self.clubs.remove(club_id).is_some()
    }

    pub fn loaded_clubs(&self) -> usize {
        self.clubs.len()
    }

    pub async fn catalog(&self) -> Arc<ModuleCatalog> {
        self.catalog.read().await.clone()
    }

    /// 重新加载目录，对所有俱乐部生效
    pub async fn reload_catalog(&self) -> Result<Arc<ModuleCatalog>, RegistryError> {
        let catalog = Arc::new(ModuleCatalog::load(&self.sources).await?);
        *self.catalog.write().await = catalog.clone();
        info!(version = %catalog.version(), "Module catalog reloaded");
        Ok(catalog)
    }

    pub fn store(&self) -> Arc<dyn RegistryStore> {
        self.store.clone()
    }
}
