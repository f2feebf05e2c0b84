//! 模块设置校验
//!
//! 按声明顺序（分组顺序，再组内顺序）校验，遇到第一个违规即返回，
//! 错误携带出错的设置 key，供表单做字段级提示。

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::models::{ModuleDefinition, SettingDefinition, SettingType, SettingsMap};

/// 自定义校验器：通过返回 Ok，失败返回原因
pub type SettingValidatorFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("valid email regex")
});

static HEX_COLOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#(?:[0-9A-Fa-f]{3}|[0-9A-Fa-f]{6}|[0-9A-Fa-f]{8})$").expect("valid color regex")
});

/// 目录声明的 pattern，按原文缓存编译结果
static PATTERNS: Lazy<DashMap<String, Regex>> = Lazy::new(DashMap::new);

fn compiled_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(re) = PATTERNS.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    PATTERNS.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// 按名称注册的自定义设置校验器
///
/// 目录中的 `validation.custom` 引用这里的名称；未注册的名称一律校验失败。
#[derive(Clone)]
pub struct SettingValidators {
    validators: HashMap<String, SettingValidatorFn>,
}

impl SettingValidators {
    /// 不含任何校验器
    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// 内置校验器：iban、email、hex_color、non_empty
    pub fn with_builtins() -> Self {
        let mut validators = Self::empty();
        validators.register("iban", validate_iban);
        validators.register("email", |value| {
            let s = value.as_str().ok_or("must be a string")?;
            if EMAIL_RE.is_match(s) {
                Ok(())
            } else {
                Err("is not a valid e-mail address".to_string())
            }
        });
        validators.register("hex_color", |value| {
            let s = value.as_str().ok_or("must be a string")?;
            if HEX_COLOR_RE.is_match(s) {
                Ok(())
            } else {
                Err("is not a hex color".to_string())
            }
        });
        validators.register("non_empty", |value| {
            let empty = match value {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            };
            if empty {
                Err("must not be empty".to_string())
            } else {
                Ok(())
            }
        });
        validators
    }

    /// 注册（或覆盖）一个校验器
    pub fn register<F>(&mut self, name: impl Into<String>, validator: F)
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validators.insert(name.into(), Arc::new(validator));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    pub fn validate(&self, name: &str, value: &Value) -> Result<(), String> {
        match self.validators.get(name) {
            Some(validator) => validator(value),
            None => Err(format!("unknown validator {name}")),
        }
    }
}

impl Default for SettingValidators {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for SettingValidators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.validators.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("SettingValidators")
            .field("validators", &names)
            .finish()
    }
}

/// ISO 13616 mod-97 校验
fn validate_iban(value: &Value) -> Result<(), String> {
    let raw = value.as_str().ok_or("must be a string")?;
    let iban: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    if !(15..=34).contains(&iban.len()) || !iban.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("is not a valid IBAN".to_string());
    }

    let (head, tail) = iban.split_at(4);
    let mut remainder: u32 = 0;
    for c in tail.chars().chain(head.chars()) {
        let digit = c
            .to_digit(36)
            .ok_or_else(|| "is not a valid IBAN".to_string())?;
        remainder = if digit >= 10 {
            (remainder * 100 + digit) % 97
        } else {
            (remainder * 10 + digit) % 97
        };
    }

    if remainder == 1 {
        Ok(())
    } else {
        Err("has an invalid IBAN checksum".to_string())
    }
}

/// 校验一个模块的完整设置表
///
/// 缺省值只在 `required` 且 `depends_on` 成立时报错；
/// 声明项全部通过后，再拒绝模块未声明的 key。
pub fn validate_settings(
    module: &ModuleDefinition,
    settings: &SettingsMap,
    validators: &SettingValidators,
) -> Result<(), RegistryError> {
    for definition in module.setting_definitions() {
        validate_setting(definition, settings, validators)?;
    }

    if let Some(unknown) = settings.keys().find(|key| module.setting(key).is_none()) {
        return Err(RegistryError::setting(
            unknown,
            format!("is not a setting of module {}", module.id),
        ));
    }

    Ok(())
}

fn validate_setting(
    definition: &SettingDefinition,
    settings: &SettingsMap,
    validators: &SettingValidators,
) -> Result<(), RegistryError> {
    let key = definition.key.as_str();
    let applicable = definition
        .depends_on
        .as_ref()
        .map_or(true, |dep| dep.is_satisfied(settings));

    let value = match settings.get(key) {
        None | Some(Value::Null) => {
            if definition.required && applicable {
                return Err(RegistryError::setting(key, "is required"));
            }
            return Ok(());
        }
        Some(value) => value,
    };

    if !definition.setting_type.accepts(value) {
        return Err(RegistryError::setting(
            key,
            format!("must be a {}", definition.setting_type.as_str()),
        ));
    }

    check_options(definition, value)?;

    let Some(rules) = &definition.validation else {
        return Ok(());
    };

    if let Some(measure) = measure(value) {
        if let Some(min) = rules.min {
            if measure < min {
                return Err(RegistryError::setting(key, format!("must be at least {min}")));
            }
        }
        if let Some(max) = rules.max {
            if measure > max {
                return Err(RegistryError::setting(key, format!("must be at most {max}")));
            }
        }
    }

    if let (Some(pattern), Some(text)) = (&rules.pattern, value.as_str()) {
        let re = compiled_pattern(pattern)
            .map_err(|e| RegistryError::setting(key, format!("has an invalid pattern: {e}")))?;
        if !re.is_match(text) {
            return Err(RegistryError::setting(key, "does not match the expected format"));
        }
    }

    if let Some(name) = &rules.custom {
        validators
            .validate(name, value)
            .map_err(|reason| RegistryError::setting(key, reason))?;
    }

    Ok(())
}

/// select / multiselect 的值必须取自候选项
fn check_options(definition: &SettingDefinition, value: &Value) -> Result<(), RegistryError> {
    if definition.options.is_empty() {
        return Ok(());
    }

    let allowed = |candidate: &Value| definition.options.iter().any(|o| &o.value == candidate);

    let valid = match definition.setting_type {
        SettingType::Select => allowed(value),
        SettingType::Multiselect => value
            .as_array()
            .is_some_and(|items| items.iter().all(allowed)),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(RegistryError::setting(&definition.key, "is not one of the allowed options"))
    }
}

/// min/max 比较的量：数字取数值，字符串与数组取长度
fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        _ => None,
    }
}

/// 当前取值下生效的设置定义（`depends_on` 成立或没有条件）
pub fn applicable_settings<'a>(
    module: &'a ModuleDefinition,
    settings: &SettingsMap,
) -> Vec<&'a SettingDefinition> {
    module
        .setting_definitions()
        .filter(|definition| {
            definition
                .depends_on
                .as_ref()
                .map_or(true, |dep| dep.is_satisfied(settings))
        })
        .collect()
}
