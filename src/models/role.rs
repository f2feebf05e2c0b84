//! Modular role and membership domain models

use super::module::{ModuleId, PermissionId, RoleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type ModulePermissions = BTreeMap<ModuleId, BTreeSet<PermissionId>>;

/// Role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModularRole {
    pub id: RoleId,
    pub club_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 层级，越大越资深
    pub level: i32,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub icon: String,
    pub is_system: bool,
    pub is_active: bool,
    #[serde(default)]
    pub module_permissions: ModulePermissions,
    /// 该角色可以管理的角色
    #[serde(default)]
    pub can_manage: Vec<RoleId>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl ModularRole {
    pub fn grants(&self, module_id: &str) -> Option<&BTreeSet<PermissionId>> {
        self.module_permissions.get(module_id)
    }

    pub fn holds(&self, module_id: &str, permission_id: &str) -> bool {
        self.grants(module_id)
            .is_some_and(|set| set.contains(permission_id))
    }

    pub fn touch(&mut self, actor: &str, at: DateTime<Utc>) {
        self.updated_at = Some(at);
        self.updated_by = Some(actor.to_string());
    }
}

/// 默认系统角色阶梯（升序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemRole {
    Membre,
    User,
    Validateur,
    Admin,
    Superadmin,
}

impl SystemRole {
    pub const LADDER: [SystemRole; 5] = [
        SystemRole::Membre,
        SystemRole::User,
        SystemRole::Validateur,
        SystemRole::Admin,
        SystemRole::Superadmin,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            SystemRole::Membre => "membre",
            SystemRole::User => "user",
            SystemRole::Validateur => "validateur",
            SystemRole::Admin => "admin",
            SystemRole::Superadmin => "superadmin",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::LADDER.into_iter().find(|r| r.id() == id)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SystemRole::Membre => "Membre",
            SystemRole::User => "Utilisateur",
            SystemRole::Validateur => "Validateur",
            SystemRole::Admin => "Administrateur",
            SystemRole::Superadmin => "Super Administrateur",
        }
    }

    pub fn level(&self) -> i32 {
        match self {
            SystemRole::Membre => -1,
            SystemRole::User => 0,
            SystemRole::Validateur => 1,
            SystemRole::Admin => 2,
            SystemRole::Superadmin => 3,
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            SystemRole::Membre => "#6B7280",
            SystemRole::User => "#10B981",
            SystemRole::Validateur => "#2563EB",
            SystemRole::Admin => "#DC2626",
            SystemRole::Superadmin => "#7C3AED",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            SystemRole::Membre => "UserMinus",
            SystemRole::User => "User",
            SystemRole::Validateur => "CheckCircle",
            SystemRole::Admin => "Shield",
            SystemRole::Superadmin => "Crown",
        }
    }

    pub fn can_manage(&self) -> Vec<RoleId> {
        let ids: &[&str] = match self {
            SystemRole::Superadmin => &["superadmin", "admin", "validateur", "user", "membre"],
            SystemRole::Admin => &["validateur", "user", "membre"],
            _ => &[],
        };
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// 构造该系统角色的初始记录，授权表为空
    pub fn to_role(&self, club_id: &str, actor: &str, at: DateTime<Utc>) -> ModularRole {
        ModularRole {
            id: self.id().to_string(),
            club_id: club_id.to_string(),
            name: self.display_name().to_string(),
            description: "Rôle système".to_string(),
            level: self.level(),
            color: self.color().to_string(),
            icon: self.icon().to_string(),
            is_system: true,
            is_active: true,
            module_permissions: ModulePermissions::new(),
            can_manage: self.can_manage(),
            created_at: at,
            created_by: actor.to_string(),
            updated_at: None,
            updated_by: None,
        }
    }
}

/// Club member (user <-> role)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClubMember {
    pub club_id: String,
    pub user_id: String,
    pub role_id: RoleId,
}

/// Create role request
#[derive(Debug, Clone, Deserialize, validator::Validate)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[serde(default)]
    #[validate(length(max = 512))]
    pub description: String,
    #[validate(range(min = -100, max = 100))]
    pub level: i32,
    #[serde(default)]
    #[validate(length(max = 32))]
    pub color: String,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub icon: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub module_permissions: ModulePermissions,
    #[serde(default)]
    pub can_manage: Vec<RoleId>,
}

fn default_true() -> bool {
    true
}

/// Update role request（只修改出现的字段）
#[derive(Debug, Clone, Default, Deserialize, validator::Validate)]
pub struct RolePatch {
    #[validate(length(min = 1, max = 64))]
    pub name: Option<String>,
    #[validate(length(max = 512))]
    pub description: Option<String>,
    #[validate(range(min = -100, max = 100))]
    pub level: Option<i32>,
    #[validate(length(max = 32))]
    pub color: Option<String>,
    #[validate(length(max = 64))]
    pub icon: Option<String>,
    pub is_active: Option<bool>,
    pub can_manage: Option<Vec<RoleId>>,
    pub module_permissions: Option<ModulePermissions>,
}

impl RolePatch {
    /// 系统角色允许修改的字段
    pub const COSMETIC_FIELDS: [&'static str; 3] = ["description", "color", "icon"];

    /// 本次修改涉及的字段名
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.name.is_some() {
            fields.push("name");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.level.is_some() {
            fields.push("level");
        }
        if self.color.is_some() {
            fields.push("color");
        }
        if self.icon.is_some() {
            fields.push("icon");
        }
        if self.is_active.is_some() {
            fields.push("is_active");
        }
        if self.can_manage.is_some() {
            fields.push("can_manage");
        }
        if self.module_permissions.is_some() {
            fields.push("module_permissions");
        }
        fields
    }

    /// 第一个系统角色不允许修改的字段
    pub fn first_restricted_field(&self) -> Option<&'static str> {
        self.touched_fields()
            .into_iter()
            .find(|f| !Self::COSMETIC_FIELDS.contains(f))
    }

    pub fn apply(self, role: &mut ModularRole) {
        if let Some(name) = self.name {
            role.name = name;
        }
        if let Some(description) = self.description {
            role.description = description;
        }
        if let Some(level) = self.level {
            role.level = level;
        }
        if let Some(color) = self.color {
            role.color = color;
        }
        if let Some(icon) = self.icon {
            role.icon = icon;
        }
        if let Some(is_active) = self.is_active {
            role.is_active = is_active;
        }
        if let Some(can_manage) = self.can_manage {
            role.can_manage = can_manage;
        }
        if let Some(module_permissions) = self.module_permissions {
            role.module_permissions = module_permissions;
        }
    }
}

/// Replace grants request
#[derive(Debug, Deserialize)]
pub struct SetPermissionsRequest {
    pub permissions: BTreeSet<PermissionId>,
}

/// Assign role request
#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    pub role_id: RoleId,
}

/// Permission check query
#[derive(Debug, Deserialize)]
pub struct PermissionCheckQuery {
    pub module_id: ModuleId,
    pub permission_id: PermissionId,
    /// 指定角色；缺省时按当前用户的成员角色判断
    #[serde(default)]
    pub role_id: Option<RoleId>,
}
