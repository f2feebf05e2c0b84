//! 统一错误模型
//! 注册表业务错误、存储错误与 HTTP 错误响应

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 存储层错误（基础设施故障，由调用方决定是否重试）
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Document already exists: {0}")]
    Conflict(String),
}

/// 模块目录加载错误
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog source {source_name} is empty")]
    Empty { source_name: String },

    #[error("Catalog source {source_name} could not be read: {reason}")]
    Unreadable { source_name: String, reason: String },

    #[error("Catalog source {source_name} is invalid: {reason}")]
    Invalid { source_name: String, reason: String },

    #[error("No catalog source could be loaded")]
    Exhausted,
}

/// 注册表业务错误
///
/// 都是逻辑错误，不重试；`Store` 表示基础设施故障。
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Module {0} is not in the catalog")]
    UnknownModule(String),

    #[error("Role {0} not found")]
    UnknownRole(String),

    #[error("Permission {permission} is not declared by module {module}")]
    UnknownPermission { module: String, permission: String },

    #[error("Module {module} requires {dependency} to be installed first")]
    DependencyMissing { module: String, dependency: String },

    #[error("Module {module} is incompatible with installed module {conflicting}")]
    IncompatibleModule { module: String, conflicting: String },

    #[error("Module {dependent} depends on {module}")]
    DependentModuleExists { module: String, dependent: String },

    #[error("Core module {0} cannot be uninstalled or disabled")]
    CoreModuleProtected(String),

    #[error("Cannot modify {field} of system role {role}")]
    SystemRoleRestricted { role: String, field: String },

    #[error("System role {0} cannot be deleted")]
    SystemRoleProtected(String),

    #[error("Role {role} is assigned to {members} member(s)")]
    RoleInUse { role: String, members: u64 },

    #[error("Setting {key}: {reason}")]
    SettingValidation { key: String, reason: String },

    #[error("Module {0} is already installed")]
    AlreadyInstalled(String),

    #[error("Module {0} is not installed")]
    ModuleNotInstalled(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Module catalog unavailable: {0}")]
    CatalogUnavailable(#[from] CatalogError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),
}

impl RegistryError {
    pub fn setting(key: &str, reason: impl Into<String>) -> Self {
        RegistryError::SettingValidation {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// 指标/日志用的稳定名称
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::UnknownModule(_) => "unknown_module",
            RegistryError::UnknownRole(_) => "unknown_role",
            RegistryError::UnknownPermission { .. } => "unknown_permission",
            RegistryError::DependencyMissing { .. } => "dependency_missing",
            RegistryError::IncompatibleModule { .. } => "incompatible_module",
            RegistryError::DependentModuleExists { .. } => "dependent_module_exists",
            RegistryError::CoreModuleProtected(_) => "core_module_protected",
            RegistryError::SystemRoleRestricted { .. } => "system_role_restricted",
            RegistryError::SystemRoleProtected(_) => "system_role_protected",
            RegistryError::RoleInUse { .. } => "role_in_use",
            RegistryError::SettingValidation { .. } => "setting_validation",
            RegistryError::AlreadyInstalled(_) => "already_installed",
            RegistryError::ModuleNotInstalled(_) => "module_not_installed",
            RegistryError::InvalidRequest(_) => "invalid_request",
            RegistryError::CatalogUnavailable(_) => "catalog_unavailable",
            RegistryError::Store(_) => "store",
        }
    }
}

impl From<validator::ValidationErrors> for RegistryError {
    fn from(e: validator::ValidationErrors) -> Self {
        RegistryError::InvalidRequest(e.to_string())
    }
}

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Registry(e) => match e {
                RegistryError::UnknownModule(_)
                | RegistryError::UnknownRole(_)
                | RegistryError::UnknownPermission { .. }
                | RegistryError::ModuleNotInstalled(_) => StatusCode::NOT_FOUND,
                RegistryError::DependencyMissing { .. }
                | RegistryError::IncompatibleModule { .. }
                | RegistryError::DependentModuleExists { .. }
                | RegistryError::CoreModuleProtected(_)
                | RegistryError::SystemRoleProtected(_)
                | RegistryError::RoleInUse { .. }
                | RegistryError::AlreadyInstalled(_) => StatusCode::CONFLICT,
                RegistryError::SystemRoleRestricted { .. } => StatusCode::FORBIDDEN,
                RegistryError::SettingValidation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                RegistryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                RegistryError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
                RegistryError::CatalogUnavailable(_) | RegistryError::Store(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Registry(RegistryError::Store(StoreError::Conflict(document))) => {
                format!("{document} already exists")
            }
            AppError::Registry(RegistryError::Store(_)) => "Storage error occurred".to_string(),
            AppError::Registry(RegistryError::CatalogUnavailable(_)) => {
                "Module catalog unavailable".to_string()
            }
            AppError::Registry(e) => e.to_string(),
            AppError::Unauthorized => "Authentication failed".to_string(),
            AppError::Forbidden => "Access denied".to_string(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::BadRequest(msg) => msg.clone(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    /// 出错的设置项（用于表单字段级提示）
    pub fn field(&self) -> Option<&str> {
        match self {
            AppError::Registry(RegistryError::SettingValidation { key, .. }) => Some(key),
            _ => None,
        }
    }

    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                field: self.field().map(str::to_string),
                request_id,
            },
        };

        if status.is_server_error() {
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::debug!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Request rejected"
            );
        }

        (status, Json(error_response)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Registry(RegistryError::Store(e))
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::BadRequest(e.to_string())
    }
}
