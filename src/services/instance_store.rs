//! 俱乐部模块实例
//!
//! 缓存一个俱乐部已安装的模块。所有变更先写存储，成功后才更新缓存。

use std::collections::BTreeMap;
use tracing::{info, instrument};

use crate::error::{RegistryError, StoreError};
use crate::models::{ModuleId, ModuleInstance, SettingDefinition, SettingsMap};
use crate::repository::RegistryStore;
use crate::services::catalog::ModuleCatalog;
use crate::services::grants::default_grants;
use crate::services::settings::{applicable_settings, validate_settings, SettingValidators};
use crate::services::identity::Stamp;

/// 一次变更调用需要的依赖
pub struct MutationContext<'a> {
    pub catalog: &'a ModuleCatalog,
    pub store: &'a dyn RegistryStore,
    pub validators: &'a SettingValidators,
    pub stamp: Stamp,
}

/// 单个俱乐部的模块实例表
#[derive(Debug, Clone)]
pub struct ModuleInstanceStore {
    club_id: String,
    instances: BTreeMap<ModuleId, ModuleInstance>,
}

impl ModuleInstanceStore {
    pub fn new(club_id: impl Into<String>) -> Self {
        Self {
            club_id: club_id.into(),
            instances: BTreeMap::new(),
        }
    }

    /// 从存储读取俱乐部的全部实例
    pub async fn load(club_id: &str, store: &dyn RegistryStore) -> Result<Self, StoreError> {
        let instances = store
            .list_instances(club_id)
            .await?
            .into_iter()
            .map(|instance| (instance.module_id.clone(), instance))
            .collect();

        Ok(Self {
            club_id: club_id.to_string(),
            instances,
        })
    }

    // ==================== Reads ====================

    pub fn get(&self, module_id: &str) -> Option<&ModuleInstance> {
        self.instances.get(module_id)
    }

    pub fn list_installed(&self) -> Vec<&ModuleInstance> {
        self.instances.values().collect()
    }

    pub fn list_active(&self) -> Vec<&ModuleInstance> {
        self.instances.values().filter(|i| i.is_active).collect()
    }

    pub fn is_installed(&self, module_id: &str) -> bool {
        self.instances.contains_key(module_id)
    }

    /// 已安装且启用
    pub fn is_active(&self, module_id: &str) -> bool {
        self.instances.get(module_id).is_some_and(|i| i.is_active)
    }

    pub fn settings(&self, module_id: &str) -> Result<&SettingsMap, RegistryError> {
        self.require(module_id).map(|i| &i.settings)
    }

    /// 当前取值下生效的设置定义
    pub fn applicable_settings<'c>(
        &self,
        catalog: &'c ModuleCatalog,
        module_id: &str,
    ) -> Result<Vec<&'c SettingDefinition>, RegistryError> {
        let module = catalog
            .get(module_id)
            .ok_or_else(|| RegistryError::UnknownModule(module_id.to_string()))?;
        let instance = self.require(module_id)?;
        Ok(applicable_settings(module, &instance.settings))
    }

    fn require(&self, module_id: &str) -> Result<&ModuleInstance, RegistryError> {
        self.instances
            .get(module_id)
            .ok_or_else(|| RegistryError::ModuleNotInstalled(module_id.to_string()))
    }

    /// 已安装模块中声明 `module_id` 为依赖的模块
    fn installed_dependent(&self, catalog: &ModuleCatalog, module_id: &str) -> Option<ModuleId> {
        self.instances
            .keys()
            .filter(|id| id.as_str() != module_id)
            .find(|id| {
                catalog
                    .get(id)
                    .is_some_and(|m| m.dependencies.contains(module_id))
            })
            .cloned()
    }

    fn reject_core(catalog: &ModuleCatalog, module_id: &str) -> Result<(), RegistryError> {
        if catalog.get(module_id).is_some_and(|m| m.is_core) {
            return Err(RegistryError::CoreModuleProtected(module_id.to_string()));
        }
        Ok(())
    }

    // ==================== Mutations ====================

    /// 安装模块
    #[instrument(skip(self, ctx, initial_settings), fields(club_id = %self.club_id))]
    pub async fn install(
        &mut self,
        ctx: &MutationContext<'_>,
        module_id: &str,
        initial_settings: Option<SettingsMap>,
    ) -> Result<ModuleInstance, RegistryError> {
        let module = ctx
            .catalog
            .get(module_id)
            .ok_or_else(|| RegistryError::UnknownModule(module_id.to_string()))?;

        if self.is_installed(module_id) {
            return Err(RegistryError::AlreadyInstalled(module_id.to_string()));
        }

        if let Some(dependency) = module
            .dependencies
            .iter()
            .find(|dep| !self.is_installed(dep))
        {
            return Err(RegistryError::DependencyMissing {
                module: module_id.to_string(),
                dependency: dependency.clone(),
            });
        }

        if let Some(conflicting) = module
            .incompatible_with
            .iter()
            .find(|other| self.is_installed(other))
        {
            return Err(RegistryError::IncompatibleModule {
                module: module_id.to_string(),
                conflicting: conflicting.clone(),
            });
        }

        // 反向：已安装模块声明了与新模块不兼容
        if let Some(conflicting) = self.instances.keys().find(|id| {
            ctx.catalog
                .get(id)
                .is_some_and(|m| m.incompatible_with.contains(module_id))
        }) {
            return Err(RegistryError::IncompatibleModule {
                module: module_id.to_string(),
                conflicting: conflicting.clone(),
            });
        }

        let settings = match initial_settings {
            Some(settings) => {
                validate_settings(module, &settings, ctx.validators)?;
                settings
            }
            None => module.default_settings(),
        };

        let instance = ModuleInstance {
            club_id: self.club_id.clone(),
            module_id: module_id.to_string(),
            settings,
            default_grants: default_grants(module),
            is_active: true,
            installed_at: ctx.stamp.at,
            installed_by: ctx.stamp.actor.clone(),
            updated_at: None,
            updated_by: None,
        };

        ctx.store.insert_instance(&instance).await?;

        self.instances
            .insert(module_id.to_string(), instance.clone());

        info!(module_id, actor = %ctx.stamp.actor, "Module installed");
        Ok(instance)
    }

    /// 卸载模块，业务数据移入归档区；返回归档的文档数
    #[instrument(skip(self, ctx), fields(club_id = %self.club_id))]
    pub async fn uninstall(
        &mut self,
        ctx: &MutationContext<'_>,
        module_id: &str,
    ) -> Result<u64, RegistryError> {
        Self::reject_core(ctx.catalog, module_id)?;

        if !self.is_installed(module_id) {
            return Err(if ctx.catalog.contains(module_id) {
                RegistryError::ModuleNotInstalled(module_id.to_string())
            } else {
                RegistryError::UnknownModule(module_id.to_string())
            });
        }

        if let Some(dependent) = self.installed_dependent(ctx.catalog, module_id) {
            return Err(RegistryError::DependentModuleExists {
                module: module_id.to_string(),
                dependent,
            });
        }

        let archived = ctx
            .store
            .archive_and_remove_module(&self.club_id, module_id)
            .await?;

        self.instances.remove(module_id);

        info!(module_id, archived, actor = %ctx.stamp.actor, "Module uninstalled");
        Ok(archived)
    }

    /// 启用模块；已启用时不做任何事。返回是否发生变化
    #[instrument(skip(self, ctx), fields(club_id = %self.club_id))]
    pub async fn enable(
        &mut self,
        ctx: &MutationContext<'_>,
        module_id: &str,
    ) -> Result<bool, RegistryError> {
        self.set_active(ctx, module_id, true).await
    }

    /// 停用模块；核心模块不可停用
    #[instrument(skip(self, ctx), fields(club_id = %self.club_id))]
    pub async fn disable(
        &mut self,
        ctx: &MutationContext<'_>,
        module_id: &str,
    ) -> Result<bool, RegistryError> {
        Self::reject_core(ctx.catalog, module_id)?;
        self.set_active(ctx, module_id, false).await
    }

    async fn set_active(
        &mut self,
        ctx: &MutationContext<'_>,
        module_id: &str,
        active: bool,
    ) -> Result<bool, RegistryError> {
        if !ctx.catalog.contains(module_id) {
            return Err(RegistryError::UnknownModule(module_id.to_string()));
        }
        let current = self.require(module_id)?;
        if current.is_active == active {
            return Ok(false);
        }

        let mut updated = current.clone();
        updated.is_active = active;
        updated.touch(&ctx.stamp.actor, ctx.stamp.at);

        ctx.store.put_instance(&updated).await?;
        self.instances.insert(module_id.to_string(), updated);

        info!(module_id, active, actor = %ctx.stamp.actor, "Module state changed");
        Ok(true)
    }

    /// 校验并整体替换模块设置
    #[instrument(skip(self, ctx, settings), fields(club_id = %self.club_id))]
    pub async fn update_settings(
        &mut self,
        ctx: &MutationContext<'_>,
        module_id: &str,
        settings: SettingsMap,
    ) -> Result<ModuleInstance, RegistryError> {
        let module = ctx
            .catalog
            .get(module_id)
            .ok_or_else(|| RegistryError::UnknownModule(module_id.to_string()))?;
        let current = self.require(module_id)?;

        validate_settings(module, &settings, ctx.validators)?;

        let mut updated = current.clone();
        updated.settings = settings;
        updated.touch(&ctx.stamp.actor, ctx.stamp.at);

        ctx.store.put_instance(&updated).await?;
        self.instances
            .insert(module_id.to_string(), updated.clone());

        info!(module_id, actor = %ctx.stamp.actor, "Module settings updated");
        Ok(updated)
    }
}
