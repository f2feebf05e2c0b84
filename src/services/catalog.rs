//! 模块目录
//!
//! 按顺序尝试多个目录来源（存储中发布的版本、配置的 JSON 文件、内置目录），
//! 某个来源只有在完整解析并通过校验后才会被采用，否则整体跳到下一个来源。
//! 目录加载后不可变，刷新即整体替换。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CatalogError, StoreError};
use crate::models::{ModuleDefinition, ModuleId};
use crate::repository::RegistryStore;

/// 编译进二进制的默认目录
const BUILTIN_CATALOG: &str = include_str!("../../catalog/modules.json");

/// 目录文件格式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub modules: Vec<ModuleDefinition>,
}

impl CatalogDocument {
    pub fn parse(source_name: &str, text: &str) -> Result<Self, CatalogError> {
        serde_json::from_str(text).map_err(|e| CatalogError::Invalid {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })
    }
}

/// 目录来源
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// 日志中使用的来源名称
    fn name(&self) -> &str;

    /// 读取该来源的全部模块定义（未校验）
    async fn fetch(&self) -> Result<Vec<ModuleDefinition>, CatalogError>;
}

pub type CatalogSources = Arc<Vec<Arc<dyn CatalogSource>>>;

/// 存储中发布的目录
pub struct StoreCatalogSource {
    store: Arc<dyn RegistryStore>,
}

impl StoreCatalogSource {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CatalogSource for StoreCatalogSource {
    fn name(&self) -> &str {
        "store"
    }

    async fn fetch(&self) -> Result<Vec<ModuleDefinition>, CatalogError> {
        self.store
            .load_catalog()
            .await
            .map_err(|e: StoreError| CatalogError::Unreadable {
                source_name: self.name().to_string(),
                reason: e.to_string(),
            })
    }
}

/// 本地 JSON 目录文件
pub struct FileCatalogSource {
    path: PathBuf,
    name: String,
}

impl FileCatalogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }
}

#[async_trait]
impl CatalogSource for FileCatalogSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<ModuleDefinition>, CatalogError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CatalogError::Unreadable {
                source_name: self.name.clone(),
                reason: e.to_string(),
            })?;

        Ok(CatalogDocument::parse(&self.name, &text)?.modules)
    }
}

/// 内置目录
pub struct BuiltinCatalogSource;

#[async_trait]
impl CatalogSource for BuiltinCatalogSource {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn fetch(&self) -> Result<Vec<ModuleDefinition>, CatalogError> {
        Ok(CatalogDocument::parse(self.name(), BUILTIN_CATALOG)?.modules)
    }
}

/// 默认来源顺序：存储 → 文件（可选）→ 内置
pub fn default_sources(
    store: Arc<dyn RegistryStore>,
    catalog_file: Option<PathBuf>,
) -> CatalogSources {
    let mut sources: Vec<Arc<dyn CatalogSource>> = vec![Arc::new(StoreCatalogSource::new(store))];
    if let Some(path) = catalog_file {
        sources.push(Arc::new(FileCatalogSource::new(path)));
    }
    sources.push(Arc::new(BuiltinCatalogSource));
    Arc::new(sources)
}

/// 已加载的模块目录
#[derive(Debug, Clone)]
pub struct ModuleCatalog {
    modules: Vec<ModuleDefinition>,
    index: HashMap<ModuleId, usize>,
    source: String,
    degraded: bool,
}

impl ModuleCatalog {
    /// 依次尝试各来源，采用第一个完整有效的目录
    pub async fn load(sources: &[Arc<dyn CatalogSource>]) -> Result<Self, CatalogError> {
        for source in sources {
            let loaded = source
                .fetch()
                .await
                .and_then(|modules| Self::from_modules(source.name(), modules));

            match loaded {
                Ok(catalog) => {
                    info!(
                        source = source.name(),
                        modules = catalog.len(),
                        version = %catalog.version(),
                        "Module catalog loaded"
                    );
                    return Ok(catalog);
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Catalog source rejected");
                }
            }
        }

        Err(CatalogError::Exhausted)
    }

    /// 内置目录
    pub fn builtin() -> Result<Self, CatalogError> {
        let document = CatalogDocument::parse("builtin", BUILTIN_CATALOG)?;
        Self::from_modules("builtin", document.modules)
    }

    /// 无可用来源时使用的空目录
    pub fn degraded() -> Self {
        Self {
            modules: Vec::new(),
            index: HashMap::new(),
            source: "none".to_string(),
            degraded: true,
        }
    }

    /// 校验并构建目录，任何一项不合法则整体拒绝
    pub fn from_modules(
        source_name: &str,
        modules: Vec<ModuleDefinition>,
    ) -> Result<Self, CatalogError> {
        let invalid = |reason: String| CatalogError::Invalid {
            source_name: source_name.to_string(),
            reason,
        };

        if modules.is_empty() {
            return Err(CatalogError::Empty {
                source_name: source_name.to_string(),
            });
        }

        let mut index = HashMap::with_capacity(modules.len());
        for (position, module) in modules.iter().enumerate() {
            module
                .check_invariants()
                .map_err(|reason| invalid(format!("module {}: {}", module.id, reason)))?;
            if index.insert(module.id.clone(), position).is_some() {
                return Err(invalid(format!("duplicate module id {}", module.id)));
            }
        }

        for module in &modules {
            if let Some(missing) = module
                .dependencies
                .iter()
                .chain(module.incompatible_with.iter())
                .find(|id| !index.contains_key(*id))
            {
                return Err(invalid(format!(
                    "module {} references unknown module {}",
                    module.id, missing
                )));
            }
        }

        Ok(Self {
            modules,
            index,
            source: source_name.to_string(),
            degraded: false,
        })
    }

    pub fn get(&self, module_id: &str) -> Option<&ModuleDefinition> {
        self.index.get(module_id).map(|&i| &self.modules[i])
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.index.contains_key(module_id)
    }

    /// 按声明顺序列出
    pub fn list_all(&self) -> &[ModuleDefinition] {
        &self.modules
    }

    /// 声明依赖该模块的目录模块
    pub fn dependents_of(&self, module_id: &str) -> Vec<&ModuleDefinition> {
        self.modules
            .iter()
            .filter(|m| m.dependencies.contains(module_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// 采用的来源名称
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// 目录摘要：模块 id 与版本的 SHA-256
    pub fn version(&self) -> String {
        let mut hasher = Sha256::new();
        for module in &self.modules {
            hasher.update(module.id.as_bytes());
            hasher.update(b"@");
            hasher.update(module.version.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// 把目录整体发布到存储（单个原子批次）
    pub async fn publish(&self, store: &dyn RegistryStore) -> Result<(), StoreError> {
        store.replace_catalog(&self.modules).await?;
        info!(
            modules = self.len(),
            version = %self.version(),
            "Module catalog published to store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SettingValidation;
    use crate::repository::MemoryRegistryStore;

    struct FailingSource;

    #[async_trait]
    impl CatalogSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn fetch(&self) -> Result<Vec<ModuleDefinition>, CatalogError> {
            Err(CatalogError::Unreadable {
                source_name: "failing".to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = ModuleCatalog::builtin().unwrap();
        assert!(catalog.contains("transactions"));
        assert!(catalog.contains("expenses"));
        assert!(catalog.contains("admin"));
        assert_eq!(
            catalog.get("events").unwrap().dependencies.iter().collect::<Vec<_>>(),
            vec!["expenses"]
        );
        assert_eq!(catalog.list_all()[0].id, "admin");
        assert!(!catalog.is_degraded());
    }

    #[test]
    fn test_dependents_of() {
        let catalog = ModuleCatalog::builtin().unwrap();
        let mut dependents: Vec<&str> = catalog
            .dependents_of("expenses")
            .into_iter()
            .map(|m| m.id.as_str())
            .collect();
        dependents.sort_unstable();
        assert_eq!(dependents, vec!["events", "excursions"]);
    }

    #[test]
    fn test_version_is_deterministic() {
        let a = ModuleCatalog::builtin().unwrap();
        let b = ModuleCatalog::builtin().unwrap();
        assert_eq!(a.version(), b.version());
        assert_eq!(a.version().len(), 16);
    }

    #[test]
    fn test_duplicate_module_rejected() {
        let catalog = ModuleCatalog::builtin().unwrap();
        let mut modules = catalog.list_all().to_vec();
        modules.push(modules[0].clone());
        assert!(matches!(
            ModuleCatalog::from_modules("test", modules),
            Err(CatalogError::Invalid { .. })
        ));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let catalog = ModuleCatalog::builtin().unwrap();
        let modules: Vec<ModuleDefinition> = catalog
            .list_all()
            .iter()
            .filter(|m| m.id != "expenses")
            .cloned()
            .collect();
        assert!(ModuleCatalog::from_modules("test", modules).is_err());
    }

    #[test]
    fn test_malformed_setting_pattern_rejects_source() {
        let catalog = ModuleCatalog::builtin().unwrap();
        let mut modules = catalog.list_all().to_vec();
        let setting = modules
            .iter_mut()
            .flat_map(|m| m.settings.iter_mut())
            .flat_map(|g| g.settings.iter_mut())
            .next()
            .unwrap();
        setting.validation = Some(SettingValidation {
            pattern: Some("^[a-z".to_string()),
            ..Default::default()
        });

        match ModuleCatalog::from_modules("test", modules) {
            Err(CatalogError::Invalid { reason, .. }) => assert!(reason.contains("invalid pattern")),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fallback_to_next_source() {
        let store = Arc::new(MemoryRegistryStore::new());
        let sources: Vec<Arc<dyn CatalogSource>> = vec![
            Arc::new(FailingSource),
            Arc::new(StoreCatalogSource::new(store)),
            Arc::new(BuiltinCatalogSource),
        ];

        let catalog = ModuleCatalog::load(&sources).await.unwrap();
        assert_eq!(catalog.source(), "builtin");
    }

    #[tokio::test]
    async fn test_published_catalog_wins() {
        let store = Arc::new(MemoryRegistryStore::new());
        let builtin = ModuleCatalog::builtin().unwrap();
        let subset: Vec<ModuleDefinition> = builtin
            .list_all()
            .iter()
            .filter(|m| m.id == "transactions" || m.id == "inventory")
            .cloned()
            .collect();
        ModuleCatalog::from_modules("test", subset)
            .unwrap()
            .publish(store.as_ref())
            .await
            .unwrap();

        let sources = default_sources(store, None);
        let catalog = ModuleCatalog::load(&sources).await.unwrap();
        assert_eq!(catalog.source(), "store");
        assert_eq!(catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_all_sources_failing() {
        let sources: Vec<Arc<dyn CatalogSource>> = vec![
            Arc::new(FailingSource),
            Arc::new(FileCatalogSource::new("/nonexistent/catalog.json")),
        ];
        assert!(matches!(
            ModuleCatalog::load(&sources).await,
            Err(CatalogError::Exhausted)
        ));
    }
}
