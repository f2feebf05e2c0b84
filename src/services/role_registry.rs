//! 俱乐部角色注册表
//!
//! 角色上的 `module_permissions` 是授权的唯一依据。
//! 所有变更先写存储，成功后才更新缓存。

use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::error::{RegistryError, StoreError};
use crate::models::{
    CreateRoleRequest, ModularRole, ModulePermissions, PermissionId, RoleId, RolePatch, SystemRole,
};
use crate::repository::RegistryStore;
use crate::services::catalog::ModuleCatalog;
use crate::services::instance_store::{ModuleInstanceStore, MutationContext};

/// 单个俱乐部的角色表
#[derive(Debug, Clone)]
pub struct RoleRegistry {
    club_id: String,
    roles: BTreeMap<RoleId, ModularRole>,
}

impl RoleRegistry {
    pub fn new(club_id: impl Into<String>) -> Self {
        Self {
            club_id: club_id.into(),
            roles: BTreeMap::new(),
        }
    }

    pub async fn load(club_id: &str, store: &dyn RegistryStore) -> Result<Self, StoreError> {
        let roles = store
            .list_roles(club_id)
            .await?
            .into_iter()
            .map(|role| (role.id.clone(), role))
            .collect();

        Ok(Self {
            club_id: club_id.to_string(),
            roles,
        })
    }

    // ==================== Reads ====================

    pub fn get(&self, role_id: &str) -> Option<&ModularRole> {
        self.roles.get(role_id)
    }

    /// 按层级从高到低
    pub fn list(&self) -> Vec<&ModularRole> {
        let mut roles: Vec<&ModularRole> = self.roles.values().collect();
        roles.sort_by(|a, b| b.level.cmp(&a.level).then_with(|| a.id.cmp(&b.id)));
        roles
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn require(&self, role_id: &str) -> Result<&ModularRole, RegistryError> {
        self.roles
            .get(role_id)
            .ok_or_else(|| RegistryError::UnknownRole(role_id.to_string()))
    }

    /// 角色是否持有权限
    ///
    /// 角色不存在或已停用、模块未安装或已停用、授权表里没有该权限，都返回 false。
    /// 模块停用不会修改任何授权数据。
    pub fn has_permission(
        &self,
        instances: &ModuleInstanceStore,
        role_id: &str,
        module_id: &str,
        permission_id: &str,
    ) -> bool {
        let Some(role) = self.roles.get(role_id) else {
            return false;
        };

        role.is_active && instances.is_active(module_id) && role.holds(module_id, permission_id)
    }

    /// 角色在已启用模块上的有效授权（用于菜单等界面）
    pub fn effective_permissions(
        &self,
        instances: &ModuleInstanceStore,
        role_id: &str,
    ) -> Result<ModulePermissions, RegistryError> {
        let role = self.require(role_id)?;
        if !role.is_active {
            return Ok(ModulePermissions::new());
        }

        Ok(role
            .module_permissions
            .iter()
            .filter(|(module_id, granted)| instances.is_active(module_id) && !granted.is_empty())
            .map(|(module_id, granted)| (module_id.clone(), granted.clone()))
            .collect())
    }

    // ==================== Validation ====================

    fn check_grants(
        catalog: &ModuleCatalog,
        module_id: &str,
        permissions: &BTreeSet<PermissionId>,
    ) -> Result<(), RegistryError> {
        let module = catalog
            .get(module_id)
            .ok_or_else(|| RegistryError::UnknownModule(module_id.to_string()))?;

        if let Some(unknown) = permissions.iter().find(|p| !module.declares_permission(p)) {
            return Err(RegistryError::UnknownPermission {
                module: module_id.to_string(),
                permission: unknown.clone(),
            });
        }

        Ok(())
    }

    fn check_grant_map(
        catalog: &ModuleCatalog,
        grants: &ModulePermissions,
    ) -> Result<(), RegistryError> {
        grants
            .iter()
            .try_for_each(|(module_id, permissions)| Self::check_grants(catalog, module_id, permissions))
    }

    fn check_can_manage(&self, can_manage: &[RoleId]) -> Result<(), RegistryError> {
        match can_manage.iter().find(|id| !self.roles.contains_key(id.as_str())) {
            Some(unknown) => Err(RegistryError::UnknownRole(unknown.clone())),
            None => Ok(()),
        }
    }

    // ==================== Mutations ====================

    /// 俱乐部没有任何角色时写入默认系统角色阶梯（单个批次）
    #[instrument(skip(self, ctx), fields(club_id = %self.club_id))]
    pub async fn seed_defaults(
        &mut self,
        ctx: &MutationContext<'_>,
    ) -> Result<Vec<ModularRole>, RegistryError> {
        if !self.roles.is_empty() {
            return Ok(Vec::new());
        }

        let roles: Vec<ModularRole> = SystemRole::LADDER
            .iter()
            .map(|tier| tier.to_role(&self.club_id, &ctx.stamp.actor, ctx.stamp.at))
            .collect();

        ctx.store.insert_roles(&roles).await?;
        for role in &roles {
            self.roles.insert(role.id.clone(), role.clone());
        }

        info!(roles = roles.len(), actor = %ctx.stamp.actor, "Default roles seeded");
        Ok(roles)
    }

    /// 创建自定义角色（不能是系统角色）
    #[instrument(skip(self, ctx, request), fields(club_id = %self.club_id, name = %request.name))]
    pub async fn create(
        &mut self,
        ctx: &MutationContext<'_>,
        request: CreateRoleRequest,
    ) -> Result<ModularRole, RegistryError> {
        request.validate()?;
        Self::check_grant_map(ctx.catalog, &request.module_permissions)?;
        self.check_can_manage(&request.can_manage)?;

        let mut module_permissions = request.module_permissions;
        module_permissions.retain(|_, granted| !granted.is_empty());

        let role = ModularRole {
            id: format!("role_{}", Uuid::new_v4().simple()),
            club_id: self.club_id.clone(),
            name: request.name,
            description: request.description,
            level: request.level,
            color: request.color,
            icon: request.icon,
            is_system: false,
            is_active: request.is_active,
            module_permissions,
            can_manage: request.can_manage,
            created_at: ctx.stamp.at,
            created_by: ctx.stamp.actor.clone(),
            updated_at: None,
            updated_by: None,
        };

        ctx.store.put_role(&role).await?;
        self.roles.insert(role.id.clone(), role.clone());

        info!(role_id = %role.id, actor = %ctx.stamp.actor, "Role created");
        Ok(role)
    }

    /// 修改角色；系统角色只允许修改 description / color / icon
    #[instrument(skip(self, ctx, patch), fields(club_id = %self.club_id))]
    pub async fn update(
        &mut self,
        ctx: &MutationContext<'_>,
        role_id: &str,
        patch: RolePatch,
    ) -> Result<ModularRole, RegistryError> {
        let current = self.require(role_id)?;

        if current.is_system {
            if let Some(field) = patch.first_restricted_field() {
                return Err(RegistryError::SystemRoleRestricted {
                    role: role_id.to_string(),
                    field: field.to_string(),
                });
            }
        }

        patch.validate()?;
        if let Some(grants) = &patch.module_permissions {
            Self::check_grant_map(ctx.catalog, grants)?;
        }
        if let Some(can_manage) = &patch.can_manage {
            self.check_can_manage(can_manage)?;
        }

        let mut updated = current.clone();
        patch.apply(&mut updated);
        updated.module_permissions.retain(|_, granted| !granted.is_empty());
        updated.touch(&ctx.stamp.actor, ctx.stamp.at);

        ctx.store.put_role(&updated).await?;
        self.roles.insert(role_id.to_string(), updated.clone());

        info!(role_id, actor = %ctx.stamp.actor, "Role updated");
        Ok(updated)
    }

    /// 删除角色：系统角色或仍有成员使用时拒绝
    #[instrument(skip(self, ctx), fields(club_id = %self.club_id))]
    pub async fn delete(
        &mut self,
        ctx: &MutationContext<'_>,
        role_id: &str,
    ) -> Result<(), RegistryError> {
        let role = self.require(role_id)?;
        if role.is_system {
            return Err(RegistryError::SystemRoleProtected(role_id.to_string()));
        }

        let members = ctx
            .store
            .count_members_with_role(&self.club_id, role_id)
            .await?;
        if members > 0 {
            return Err(RegistryError::RoleInUse {
                role: role_id.to_string(),
                members,
            });
        }

        ctx.store.delete_role(&self.club_id, role_id).await?;
        self.roles.remove(role_id);

        info!(role_id, actor = %ctx.stamp.actor, "Role deleted");
        Ok(())
    }

    /// 授予权限；已持有时不做任何事。返回是否发生变化
    #[instrument(skip(self, ctx), fields(club_id = %self.club_id))]
    pub async fn grant_permission(
        &mut self,
        ctx: &MutationContext<'_>,
        role_id: &str,
        module_id: &str,
        permission_id: &str,
    ) -> Result<bool, RegistryError> {
        let current = self.require(role_id)?;
        Self::check_grants(
            ctx.catalog,
            module_id,
            &BTreeSet::from([permission_id.to_string()]),
        )?;

        if current.holds(module_id, permission_id) {
            return Ok(false);
        }

        let mut updated = current.clone();
        updated
            .module_permissions
            .entry(module_id.to_string())
            .or_default()
            .insert(permission_id.to_string());
        updated.touch(&ctx.stamp.actor, ctx.stamp.at);

        self.persist(ctx, updated).await?;
        info!(role_id, module_id, permission_id, actor = %ctx.stamp.actor, "Permission granted");
        Ok(true)
    }

    /// 撤销权限；未持有时不做任何事。返回是否发生变化
    #[instrument(skip(self, ctx), fields(club_id = %self.club_id))]
    pub async fn revoke_permission(
        &mut self,
        ctx: &MutationContext<'_>,
        role_id: &str,
        module_id: &str,
        permission_id: &str,
    ) -> Result<bool, RegistryError> {
        let current = self.require(role_id)?;
        Self::check_grants(
            ctx.catalog,
            module_id,
            &BTreeSet::from([permission_id.to_string()]),
        )?;

        if !current.holds(module_id, permission_id) {
            return Ok(false);
        }

        let mut updated = current.clone();
        if let Some(granted) = updated.module_permissions.get_mut(module_id) {
            granted.remove(permission_id);
            if granted.is_empty() {
                updated.module_permissions.remove(module_id);
            }
        }
        updated.touch(&ctx.stamp.actor, ctx.stamp.at);

        self.persist(ctx, updated).await?;
        info!(role_id, module_id, permission_id, actor = %ctx.stamp.actor, "Permission revoked");
        Ok(true)
    }

    /// 整体替换角色在某模块上的授权；空集合移除该模块条目
    #[instrument(skip(self, ctx, permissions), fields(club_id = %self.club_id))]
    pub async fn set_module_permissions(
        &mut self,
        ctx: &MutationContext<'_>,
        role_id: &str,
        module_id: &str,
        permissions: BTreeSet<PermissionId>,
    ) -> Result<ModularRole, RegistryError> {
        let current = self.require(role_id)?;
        Self::check_grants(ctx.catalog, module_id, &permissions)?;

        let mut updated = current.clone();
        if permissions.is_empty() {
            updated.module_permissions.remove(module_id);
        } else {
            updated
                .module_permissions
                .insert(module_id.to_string(), permissions);
        }
        updated.touch(&ctx.stamp.actor, ctx.stamp.at);

        self.persist(ctx, updated.clone()).await?;
        info!(role_id, module_id, actor = %ctx.stamp.actor, "Module permissions replaced");
        Ok(updated)
    }

    async fn persist(
        &mut self,
        ctx: &MutationContext<'_>,
        role: ModularRole,
    ) -> Result<(), RegistryError> {
        ctx.store.put_role(&role).await?;
        self.roles.insert(role.id.clone(), role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRegistryStore;
    use crate::services::identity::{Stamp, StaticIdentity};
    use crate::services::settings::SettingValidators;

    struct Fixture {
        catalog: ModuleCatalog,
        store: MemoryRegistryStore,
        validators: SettingValidators,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                catalog: ModuleCatalog::builtin().unwrap(),
                store: MemoryRegistryStore::new(),
                validators: SettingValidators::with_builtins(),
            }
        }

        fn ctx(&self) -> MutationContext<'_> {
            MutationContext {
                catalog: &self.catalog,
                store: &self.store,
                validators: &self.validators,
                stamp: Stamp::now(&StaticIdentity::new("president")),
            }
        }
    }

    fn create_request(name: &str) -> CreateRoleRequest {
        CreateRoleRequest {
            name: name.to_string(),
            description: String::new(),
            level: 1,
            color: "#0EA5E9".to_string(),
            icon: "Wallet".to_string(),
            is_active: true,
            module_permissions: ModulePermissions::new(),
            can_manage: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let fx = Fixture::new();
        let mut roles = RoleRegistry::new("club-1");

        let seeded = roles.seed_defaults(&fx.ctx()).await.unwrap();
        assert_eq!(seeded.len(), 5);
        assert!(seeded.iter().all(|r| r.is_system && r.module_permissions.is_empty()));
        assert_eq!(roles.list()[0].id, "superadmin");

        assert!(roles.seed_defaults(&fx.ctx()).await.unwrap().is_empty());
        assert_eq!(fx.store.list_roles("club-1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_permission() {
        let fx = Fixture::new();
        let mut roles = RoleRegistry::new("club-1");

        let mut request = create_request("Trésorier");
        request.module_permissions.insert(
            "expenses".to_string(),
            BTreeSet::from(["fly".to_string()]),
        );
        assert!(matches!(
            roles.create(&fx.ctx(), request).await,
            Err(RegistryError::UnknownPermission { .. })
        ));

        let role = roles.create(&fx.ctx(), create_request("Trésorier")).await.unwrap();
        assert!(role.id.starts_with("role_"));
        assert!(!role.is_system);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let fx = Fixture::new();
        let mut roles = RoleRegistry::new("club-1");
        assert!(matches!(
            roles.create(&fx.ctx(), create_request("")).await,
            Err(RegistryError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_role_in_use() {
        let fx = Fixture::new();
        let mut roles = RoleRegistry::new("club-1");
        let role = roles.create(&fx.ctx(), create_request("Moniteur")).await.unwrap();

        fx.store.set_member_role("club-1", "u1", &role.id).await.unwrap();
        assert!(matches!(
            roles.delete(&fx.ctx(), &role.id).await,
            Err(RegistryError::RoleInUse { members: 1, .. })
        ));

        fx.store.set_member_role("club-1", "u1", "user").await.unwrap();
        roles.delete(&fx.ctx(), &role.id).await.unwrap();
        assert!(roles.get(&role.id).is_none());
    }

    #[tokio::test]
    async fn test_revoke_last_permission_removes_module_entry() {
        let fx = Fixture::new();
        let mut roles = RoleRegistry::new("club-1");
        roles.seed_defaults(&fx.ctx()).await.unwrap();

        assert!(roles.grant_permission(&fx.ctx(), "user", "expenses", "create").await.unwrap());
        assert!(!roles.grant_permission(&fx.ctx(), "user", "expenses", "create").await.unwrap());
        assert!(roles.revoke_permission(&fx.ctx(), "user", "expenses", "create").await.unwrap());
        assert!(!roles.revoke_permission(&fx.ctx(), "user", "expenses", "create").await.unwrap());
        assert!(roles.get("user").unwrap().grants("expenses").is_none());
    }
}
