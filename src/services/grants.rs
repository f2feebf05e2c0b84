//! 安装时的默认授权推导
//!
//! 按系统角色层级从模块的权限声明中挑选初始授权，结果只存放在模块实例上
//! 作参考，权限判断始终以角色自身的授权表为准。

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{
    ModuleDefinition, PermissionCategory, PermissionDefinition, PermissionId, RiskLevel, RoleId,
    SystemRole,
};

/// 某层级是否默认获得该权限
pub fn tier_includes(tier: SystemRole, permission: &PermissionDefinition) -> bool {
    match tier {
        SystemRole::Superadmin => true,
        SystemRole::Admin => permission.risk_level != RiskLevel::Critical,
        SystemRole::Validateur => {
            permission.category != PermissionCategory::Admin
                && permission.risk_level != RiskLevel::High
        }
        SystemRole::User => {
            permission.category == PermissionCategory::View
                || permission.risk_level == RiskLevel::Low
        }
        SystemRole::Membre => false,
    }
}

/// 推导模块各系统角色的初始授权（空集合的层级不出现）
pub fn default_grants(module: &ModuleDefinition) -> BTreeMap<RoleId, BTreeSet<PermissionId>> {
    SystemRole::LADDER
        .into_iter()
        .filter_map(|tier| {
            let granted: BTreeSet<PermissionId> = module
                .permission_definitions()
                .filter(|p| tier_includes(tier, p))
                .map(|p| p.id.clone())
                .collect();
            (!granted.is_empty()).then(|| (tier.id().to_string(), granted))
        })
        .collect()
}
