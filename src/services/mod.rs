//! 注册表业务服务层

pub mod catalog;
pub mod grants;
pub mod identity;
pub mod instance_store;
pub mod registry_service;
pub mod role_registry;
pub mod settings;

pub use catalog::{
    default_sources, BuiltinCatalogSource, CatalogDocument, CatalogSource, CatalogSources,
    FileCatalogSource, ModuleCatalog, StoreCatalogSource,
};
pub use identity::{IdentityProvider, Stamp, StaticIdentity};
pub use instance_store::{ModuleInstanceStore, MutationContext};
pub use registry_service::{RegistryHub, RegistryService, SharedCatalog};
pub use role_registry::RoleRegistry;
pub use settings::{SettingValidators, validate_settings};
