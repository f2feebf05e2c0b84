//! Module catalog domain models
//! 模块定义、设置模式与权限模式

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

pub type ModuleId = String;
pub type PermissionId = String;
pub type RoleId = String;

/// 扁平化的设置值（按点分 key 存储）
pub type SettingsMap = BTreeMap<String, Value>;

/// 模块分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCategory {
    Core,
    Finance,
    Operations,
    Communication,
    Admin,
    Extension,
}

/// 设置值类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingType {
    Boolean,
    Number,
    String,
    Select,
    Multiselect,
    Json,
    Date,
    Color,
}

impl SettingType {
    /// 值是否满足该类型
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            SettingType::Boolean => value.is_boolean(),
            SettingType::Number => value.is_number(),
            SettingType::String => value.is_string(),
            SettingType::Select => value.is_string() || value.is_number() || value.is_boolean(),
            SettingType::Multiselect => value.is_array(),
            SettingType::Json => true,
            SettingType::Date => value.as_str().is_some_and(is_date_literal),
            SettingType::Color => value.as_str().is_some_and(is_color_literal),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingType::Boolean => "boolean",
            SettingType::Number => "number",
            SettingType::String => "string",
            SettingType::Select => "select",
            SettingType::Multiselect => "multiselect",
            SettingType::Json => "json",
            SettingType::Date => "date",
            SettingType::Color => "color",
        }
    }
}

fn is_date_literal(s: &str) -> bool {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

fn is_color_literal(s: &str) -> bool {
    let Some(hex) = s.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3 | 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// 设置校验规则
///
/// `min`/`max` 对数字比较数值，对字符串和多选比较长度。
/// `custom` 是在 `SettingValidators` 中注册的校验器名称。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingValidation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,
}

/// select / multiselect 的候选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingOption {
    pub value: Value,
    pub label: String,
}

/// 设置可见性条件：`"otherKey"` 或 `"otherKey=value"`
///
/// 只针对同一个设置表求值。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SettingDependency {
    pub key: String,
    pub expected: Option<String>,
}

impl SettingDependency {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expected: None,
        }
    }

    pub fn equals(key: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            expected: Some(expected.into()),
        }
    }

    /// 针对当前设置表判断条件是否成立
    pub fn is_satisfied(&self, settings: &SettingsMap) -> bool {
        let Some(value) = settings.get(&self.key) else {
            return false;
        };

        match &self.expected {
            None => is_truthy(value),
            Some(expected) => match value {
                Value::Null => false,
                Value::String(s) => s == expected,
                other => other.to_string() == *expected,
            },
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

impl TryFrom<String> for SettingDependency {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let (key, expected) = match raw.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
            None => (raw.trim(), None),
        };

        if key.is_empty() {
            return Err(format!("invalid depends_on expression: {raw:?}"));
        }

        Ok(Self {
            key: key.to_string(),
            expected,
        })
    }
}

impl From<SettingDependency> for String {
    fn from(dep: SettingDependency) -> Self {
        dep.to_string()
    }
}

impl fmt::Display for SettingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected {
            Some(expected) => write!(f, "{}={}", self.key, expected),
            None => f.write_str(&self.key),
        }
    }
}

/// 单个可配置项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDefinition {
    pub key: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub setting_type: SettingType,
    pub default_value: Value,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<SettingValidation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<SettingOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<SettingDependency>,
    #[serde(default)]
    pub advanced: bool,
}

/// 设置分组（保持声明顺序）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingGroup {
    pub category: String,
    pub settings: Vec<SettingDefinition>,
}

/// 权限动作分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    View,
    Create,
    Update,
    Delete,
    Manage,
    Admin,
}

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// 可授予的权限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDefinition {
    pub id: PermissionId,
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub category: PermissionCategory,
    pub risk_level: RiskLevel,
    /// 仅作说明，注册表不解释
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_condition: Option<String>,
    /// 仅作说明，不做传递展开
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implied_permissions: Vec<PermissionId>,
}

/// 权限分组（保持声明顺序）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGroup {
    pub category: String,
    pub permissions: Vec<PermissionDefinition>,
}

// ==================== UI wiring ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRoute {
    pub path: String,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleMenuItem {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_items: Vec<ModuleMenuItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetPosition {
    Dashboard,
    Sidebar,
    Header,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleWidget {
    pub id: String,
    pub component: String,
    pub position: WidgetPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_size: Option<(u32, u32)>,
}

/// 生命周期钩子名称（只携带，不执行）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_install: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_uninstall: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_enable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_disable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleScheduledTask {
    pub id: String,
    pub name: String,
    /// Cron expression
    pub schedule: String,
    pub handler: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ModuleRoute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub menu_items: Vec<ModuleMenuItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub widgets: Vec<ModuleWidget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<ModuleHooks>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduled_tasks: Vec<ModuleScheduledTask>,
}

// ==================== Module definition ====================

/// 目录中的模块定义，加载后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub id: ModuleId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: String,
    pub version: String,
    pub category: ModuleCategory,
    #[serde(default)]
    pub is_core: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<ModuleId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub incompatible_with: BTreeSet<ModuleId>,
    #[serde(default)]
    pub settings: Vec<SettingGroup>,
    #[serde(default)]
    pub permissions: Vec<PermissionGroup>,
    #[serde(default)]
    pub config: ModuleConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl ModuleDefinition {
    /// 按声明顺序遍历所有设置
    pub fn setting_definitions(&self) -> impl Iterator<Item = &SettingDefinition> {
        self.settings.iter().flat_map(|group| group.settings.iter())
    }

    pub fn setting(&self, key: &str) -> Option<&SettingDefinition> {
        self.setting_definitions().find(|s| s.key == key)
    }

    /// 按声明顺序遍历所有权限
    pub fn permission_definitions(&self) -> impl Iterator<Item = &PermissionDefinition> {
        self.permissions.iter().flat_map(|group| group.permissions.iter())
    }

    pub fn permission(&self, id: &str) -> Option<&PermissionDefinition> {
        self.permission_definitions().find(|p| p.id == id)
    }

    pub fn declares_permission(&self, id: &str) -> bool {
        self.permission(id).is_some()
    }

    pub fn permission_ids(&self) -> Vec<PermissionId> {
        self.permission_definitions().map(|p| p.id.clone()).collect()
    }

    /// 每个设置的默认值
    pub fn default_settings(&self) -> SettingsMap {
        self.setting_definitions()
            .map(|s| (s.key.clone(), s.default_value.clone()))
            .collect()
    }

    /// 校验模块内部不变量
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("module id must not be empty".to_string());
        }

        let mut keys = HashSet::new();
        for setting in self.setting_definitions() {
            if !keys.insert(setting.key.as_str()) {
                return Err(format!("duplicate setting key {}", setting.key));
            }
            if !setting.setting_type.accepts(&setting.default_value) {
                return Err(format!(
                    "default value of {} is not a valid {}",
                    setting.key,
                    setting.setting_type.as_str()
                ));
            }
            if let Some(pattern) = setting.validation.as_ref().and_then(|v| v.pattern.as_deref()) {
                if let Err(e) = Regex::new(pattern) {
                    return Err(format!("setting {} has an invalid pattern: {e}", setting.key));
                }
            }
        }

        for setting in self.setting_definitions() {
            if let Some(dep) = &setting.depends_on {
                if !keys.contains(dep.key.as_str()) {
                    return Err(format!(
                        "setting {} depends on unknown setting {}",
                        setting.key, dep.key
                    ));
                }
            }
        }

        let mut ids = HashSet::new();
        for permission in self.permission_definitions() {
            if !ids.insert(permission.id.as_str()) {
                return Err(format!("duplicate permission id {}", permission.id));
            }
        }

        for permission in self.permission_definitions() {
            if let Some(missing) = permission
                .implied_permissions
                .iter()
                .find(|implied| !ids.contains(implied.as_str()))
            {
                return Err(format!(
                    "permission {} implies undeclared permission {}",
                    permission.id, missing
                ));
            }
        }

        if self.dependencies.contains(&self.id) || self.incompatible_with.contains(&self.id) {
            return Err("module cannot depend on or exclude itself".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependency_parse() {
        let plain = SettingDependency::try_from("workflow.autoApprove".to_string()).unwrap();
        assert_eq!(plain.key, "workflow.autoApprove");
        assert_eq!(plain.expected, None);

        let eq = SettingDependency::try_from("payment.defaultPaymentMethod=transfer".to_string())
            .unwrap();
        assert_eq!(eq.key, "payment.defaultPaymentMethod");
        assert_eq!(eq.expected.as_deref(), Some("transfer"));
        assert_eq!(eq.to_string(), "payment.defaultPaymentMethod=transfer");

        assert!(SettingDependency::try_from("=x".to_string()).is_err());
    }

    #[test]
    fn test_dependency_evaluation() {
        let mut settings = SettingsMap::new();
        settings.insert("a".to_string(), json!(true));
        settings.insert("method".to_string(), json!("cash"));
        settings.insert("count".to_string(), json!(3));

        assert!(SettingDependency::new("a").is_satisfied(&settings));
        assert!(!SettingDependency::new("missing").is_satisfied(&settings));
        assert!(!SettingDependency::equals("method", "transfer").is_satisfied(&settings));
        assert!(SettingDependency::equals("method", "cash").is_satisfied(&settings));
        assert!(SettingDependency::equals("count", "3").is_satisfied(&settings));

        settings.insert("a".to_string(), json!(false));
        assert!(!SettingDependency::new("a").is_satisfied(&settings));
    }

    #[test]
    fn test_setting_type_accepts() {
        assert!(SettingType::Boolean.accepts(&json!(false)));
        assert!(!SettingType::Boolean.accepts(&json!("false")));
        assert!(SettingType::Number.accepts(&json!(1.5)));
        assert!(SettingType::Color.accepts(&json!("#7C3AED")));
        assert!(!SettingType::Color.accepts(&json!("purple")));
        assert!(SettingType::Date.accepts(&json!("2024-01-01")));
        assert!(!SettingType::Date.accepts(&json!("01/01/2024")));
        assert!(SettingType::Multiselect.accepts(&json!(["a", "b"])));
        assert!(SettingType::Json.accepts(&json!({"any": "thing"})));
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }
}
