//! Per-club module instance models

use super::module::{ModuleId, PermissionId, RoleId, SettingsMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 俱乐部已安装的模块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInstance {
    pub club_id: String,
    pub module_id: ModuleId,
    pub settings: SettingsMap,
    /// 安装时按系统角色层级推导的初始授权，仅供展示。
    /// 权限判断只读取角色上的授权表。
    #[serde(default)]
    pub default_grants: BTreeMap<RoleId, BTreeSet<PermissionId>>,
    pub is_active: bool,
    pub installed_at: DateTime<Utc>,
    pub installed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl ModuleInstance {
    /// 记录修改者与时间
    pub fn touch(&mut self, actor: &str, at: DateTime<Utc>) {
        self.updated_at = Some(at);
        self.updated_by = Some(actor.to_string());
    }
}

/// 安装模块请求
#[derive(Debug, Default, Deserialize)]
pub struct InstallModuleRequest {
    #[serde(default)]
    pub settings: Option<SettingsMap>,
}

/// 更新设置请求（整体替换）
#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    pub settings: SettingsMap,
}

/// 已安装模块列表过滤
#[derive(Debug, Default, Deserialize)]
pub struct ListModulesQuery {
    #[serde(default)]
    pub active: Option<bool>,
}
