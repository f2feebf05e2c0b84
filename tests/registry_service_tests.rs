//! 注册表服务集成测试
//!
//! 覆盖模块安装依赖、核心模块保护、设置校验、按模块启停的权限判定等行为

use async_trait::async_trait;
use calycompta_registry::{
    error::{CatalogError, RegistryError},
    models::{ModuleDefinition, RolePatch, SettingsMap},
    repository::{MemoryRegistryStore, RegistryStore},
    services::{
        CatalogSource, ModuleCatalog, RegistryHub, RegistryService, SettingValidators,
        StaticIdentity,
    },
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

mod common;
use common::{create_test_registry, registry_over, TEST_CLUB};

/// 固定模块列表的目录来源
struct StaticSource(Vec<ModuleDefinition>);

#[async_trait]
impl CatalogSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Vec<ModuleDefinition>, CatalogError> {
        Ok(self.0.clone())
    }
}

struct OfflineSource;

#[async_trait]
impl CatalogSource for OfflineSource {
    fn name(&self) -> &str {
        "offline"
    }

    async fn fetch(&self) -> Result<Vec<ModuleDefinition>, CatalogError> {
        Err(CatalogError::Unreadable {
            source_name: "offline".to_string(),
            reason: "connection refused".to_string(),
        })
    }
}

async fn registry_with_source(source: impl CatalogSource + 'static) -> RegistryService {
    let sources: Vec<Arc<dyn CatalogSource>> = vec![Arc::new(source)];
    RegistryService::initialize(
        TEST_CLUB,
        Arc::new(MemoryRegistryStore::new()),
        Arc::new(sources),
        Arc::new(StaticIdentity::new("tresorier")),
    )
    .await
}

async fn install_all(registry: &RegistryService, modules: &[&str]) {
    for module_id in modules {
        registry
            .install(module_id, None)
            .await
            .unwrap_or_else(|e| panic!("install {module_id} failed: {e}"));
    }
}

fn permission_set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// ==================== 依赖 ====================

#[tokio::test]
async fn test_events_requires_expenses_scenario() {
    // expenses 需要可停用，使用非核心目录
    let registry = registry_with_source(StaticSource(non_core_catalog())).await;

    let result = registry.install("events", None).await;
    match result {
        Err(RegistryError::DependencyMissing { module, dependency }) => {
            assert_eq!(module, "events");
            assert_eq!(dependency, "expenses");
        }
        other => panic!("expected DependencyMissing, got {other:?}"),
    }
    assert!(!registry.is_installed("events").await);

    install_all(&registry, &["expenses", "events"]).await;
    assert!(registry.is_active("events").await);

    registry.seed_default_roles().await.unwrap();
    assert!(registry
        .grant_permission("validateur", "expenses", "approve")
        .await
        .unwrap());
    assert!(registry.has_permission("validateur", "expenses", "approve").await);

    // 停用只影响判定，不修改授权数据
    assert!(registry.disable("expenses").await.unwrap());
    assert!(!registry.has_permission("validateur", "expenses", "approve").await);
    let role = registry.get_role("validateur").await.unwrap();
    assert!(role.holds("expenses", "approve"));

    assert!(registry.enable("expenses").await.unwrap());
    assert!(registry.has_permission("validateur", "expenses", "approve").await);
}

#[tokio::test]
async fn test_dependency_gating_ignores_unrelated_history() {
    // 无关操作的不同顺序
    let orderings: Vec<Vec<&str>> = vec![
        vec![],
        vec!["install:transactions", "install:inventory", "seed"],
        vec!["seed", "install:inventory", "disable:inventory"],
        vec!["install:inventory", "disable:inventory", "enable:inventory", "seed"],
        vec!["disable:inventory", "install:admin", "install:transactions"],
        vec!["install:expenses", "install:inventory", "uninstall:inventory"],
    ];

    for ordering in orderings {
        let (_store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;

        for step in &ordering {
            let (op, module_id) = step.split_once(':').unwrap_or((*step, ""));
            let _ = match op {
                "install" => registry.install(module_id, None).await.map(|_| ()),
                "uninstall" => registry.uninstall(module_id).await.map(|_| ()),
                "enable" => registry.enable(module_id).await.map(|_| ()),
                "disable" => registry.disable(module_id).await.map(|_| ()),
                "seed" => registry.seed_default_roles().await.map(|_| ()),
                _ => unreachable!(),
            };
        }

        let result = registry.install("excursions", None).await;
        assert!(
            matches!(result, Err(RegistryError::DependencyMissing { .. })),
            "ordering {ordering:?} produced {result:?}"
        );
        assert!(!registry.is_installed("excursions").await);
    }
}

#[tokio::test]
async fn test_uninstall_blocked_by_dependent() {
    let registry = registry_with_source(StaticSource(non_core_catalog())).await;
    install_all(&registry, &["expenses", "events"]).await;

    let result = registry.uninstall("expenses").await;
    assert!(matches!(
        result,
        Err(RegistryError::DependentModuleExists { ref dependent, .. }) if dependent == "events"
    ));

    registry.uninstall("events").await.unwrap();
    registry.uninstall("expenses").await.unwrap();
    assert!(registry.list_installed().await.is_empty());
}

#[tokio::test]
async fn test_incompatibility_is_symmetric() {
    let mut modules = ModuleCatalog::builtin().unwrap().list_all().to_vec();
    for module in modules.iter_mut().filter(|m| m.id == "inventory") {
        module.incompatible_with.insert("excursions".to_string());
    }

    // 声明方后安装
    let registry = registry_with_source(StaticSource(modules.clone())).await;
    install_all(&registry, &["expenses", "events", "excursions"]).await;
    assert!(matches!(
        registry.install("inventory", None).await,
        Err(RegistryError::IncompatibleModule { .. })
    ));

    // 声明方先安装
    let registry = registry_with_source(StaticSource(modules)).await;
    install_all(&registry, &["inventory", "expenses", "events"]).await;
    assert!(matches!(
        registry.install("excursions", None).await,
        Err(RegistryError::IncompatibleModule { ref conflicting, .. }) if conflicting == "inventory"
    ));
}

#[tokio::test]
async fn test_reinstall_fails_with_already_installed() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    registry.install("inventory", None).await.unwrap();

    assert!(matches!(
        registry.install("inventory", None).await,
        Err(RegistryError::AlreadyInstalled(_))
    ));
    assert!(matches!(
        registry.install("bar", None).await,
        Err(RegistryError::UnknownModule(_))
    ));
}

// ==================== 核心模块 ====================

#[tokio::test]
async fn test_core_modules_cannot_be_uninstalled_or_disabled() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    let catalog = registry.catalog().await;
    let core: Vec<String> = catalog
        .list_all()
        .iter()
        .filter(|m| m.is_core)
        .map(|m| m.id.clone())
        .collect();
    assert!(!core.is_empty());

    // 未安装时
    for module_id in &core {
        assert!(matches!(
            registry.uninstall(module_id).await,
            Err(RegistryError::CoreModuleProtected(_))
        ));
        assert!(matches!(
            registry.disable(module_id).await,
            Err(RegistryError::CoreModuleProtected(_))
        ));
    }

    // 已安装时
    install_all(&registry, &["admin", "transactions", "expenses", "events"]).await;
    for module_id in &core {
        assert!(matches!(
            registry.uninstall(module_id).await,
            Err(RegistryError::CoreModuleProtected(_))
        ));
        assert!(matches!(
            registry.disable(module_id).await,
            Err(RegistryError::CoreModuleProtected(_))
        ));
        assert!(registry.is_active(module_id).await);
    }
}

// ==================== 设置 ====================

#[tokio::test]
async fn test_settings_bounds_are_deterministic() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    registry.install("transactions", None).await.unwrap();

    let with_threshold = |value: serde_json::Value| -> SettingsMap {
        let mut settings = SettingsMap::new();
        settings.insert("validation.requireDoubleSignature".to_string(), json!(true));
        settings.insert("validation.signatureThreshold".to_string(), value);
        settings
    };

    for rejected in [json!(-1), json!(10001), json!(-0.5), json!(10000.5)] {
        let result = registry
            .update_settings("transactions", with_threshold(rejected.clone()))
            .await;
        assert!(
            matches!(
                result,
                Err(RegistryError::SettingValidation { ref key, .. }) if key == "validation.signatureThreshold"
            ),
            "{rejected} should be rejected"
        );
    }

    for accepted in [json!(0), json!(1), json!(5000), json!(9999.99), json!(10000)] {
        let instance = registry
            .update_settings("transactions", with_threshold(accepted.clone()))
            .await
            .unwrap();
        assert_eq!(instance.settings["validation.signatureThreshold"], accepted);
    }
}

#[tokio::test]
async fn test_failed_settings_update_keeps_previous_values() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    registry.install("expenses", None).await.unwrap();
    let before = registry.settings("expenses").await.unwrap();

    let mut invalid = before.clone();
    invalid.insert("workflow.receiptThreshold".to_string(), json!(250));
    assert!(registry.update_settings("expenses", invalid).await.is_err());

    assert_eq!(registry.settings("expenses").await.unwrap(), before);
}

#[tokio::test]
async fn test_applicable_settings_follow_conditions() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    registry.install("expenses", None).await.unwrap();

    let keys = |defs: Vec<calycompta_registry::models::SettingDefinition>| -> Vec<String> {
        defs.into_iter().map(|d| d.key).collect()
    };

    // 默认付款方式为 transfer，requireIBAN 可见
    let applicable = keys(registry.applicable_settings("expenses").await.unwrap());
    assert!(applicable.contains(&"payment.requireIBAN".to_string()));
    assert!(!applicable.contains(&"workflow.autoApproveThreshold".to_string()));

    let mut settings = registry.settings("expenses").await.unwrap();
    settings.insert("payment.defaultPaymentMethod".to_string(), json!("cash"));
    settings.insert("workflow.autoApprove".to_string(), json!(true));
    registry.update_settings("expenses", settings).await.unwrap();

    let applicable = keys(registry.applicable_settings("expenses").await.unwrap());
    assert!(!applicable.contains(&"payment.requireIBAN".to_string()));
    assert!(applicable.contains(&"workflow.autoApproveThreshold".to_string()));
}

// ==================== 角色 ====================

#[tokio::test]
async fn test_system_role_field_restriction() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "president").await;
    registry.seed_default_roles().await.unwrap();

    let rename = RolePatch {
        name: Some("x".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        registry.update_role("admin", rename).await,
        Err(RegistryError::SystemRoleRestricted { ref field, .. }) if field == "name"
    ));

    let describe = RolePatch {
        description: Some("x".to_string()),
        ..Default::default()
    };
    let role = registry.update_role("admin", describe).await.unwrap();
    assert_eq!(role.description, "x");
    assert_eq!(role.name, "Administrateur");
    assert_eq!(role.updated_by.as_deref(), Some("president"));

    assert!(matches!(
        registry.delete_role("admin").await,
        Err(RegistryError::SystemRoleProtected(_))
    ));
}

#[tokio::test]
async fn test_set_module_permissions_round_trip() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "president").await;
    registry.seed_default_roles().await.unwrap();

    let granted = permission_set(&["view_all", "approve", "reject", "view_own"]);
    registry
        .set_module_permissions("validateur", "expenses", granted.clone())
        .await
        .unwrap();

    let role = registry.get_role("validateur").await.unwrap();
    assert_eq!(role.grants("expenses"), Some(&granted));

    // 空集合移除条目
    registry
        .set_module_permissions("validateur", "expenses", BTreeSet::new())
        .await
        .unwrap();
    let role = registry.get_role("validateur").await.unwrap();
    assert_eq!(role.grants("expenses"), None);

    assert!(matches!(
        registry
            .set_module_permissions("validateur", "expenses", permission_set(&["fly"]))
            .await,
        Err(RegistryError::UnknownPermission { .. })
    ));
}

#[tokio::test]
async fn test_grant_and_revoke_are_idempotent() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "president").await;
    registry.seed_default_roles().await.unwrap();

    assert!(registry.grant_permission("user", "events", "register").await.unwrap());
    assert!(!registry.grant_permission("user", "events", "register").await.unwrap());
    assert!(registry.revoke_permission("user", "events", "register").await.unwrap());
    assert!(!registry.revoke_permission("user", "events", "register").await.unwrap());

    assert!(matches!(
        registry.grant_permission("ghost", "events", "register").await,
        Err(RegistryError::UnknownRole(_))
    ));
}

#[tokio::test]
async fn test_inactive_role_grants_nothing() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "president").await;
    install_all(&registry, &["expenses"]).await;
    registry.seed_default_roles().await.unwrap();

    let role = registry
        .create_role(calycompta_registry::models::CreateRoleRequest {
            name: "Trésorier".to_string(),
            description: String::new(),
            level: 1,
            color: "#0EA5E9".to_string(),
            icon: "Wallet".to_string(),
            is_active: true,
            module_permissions: [("expenses".to_string(), permission_set(&["approve"]))]
                .into_iter()
                .collect(),
            can_manage: vec!["user".to_string()],
        })
        .await
        .unwrap();
    assert!(role.id.starts_with("role_"));
    assert!(!role.is_system);
    assert!(registry.has_permission(&role.id, "expenses", "approve").await);

    let deactivate = RolePatch {
        is_active: Some(false),
        ..Default::default()
    };
    registry.update_role(&role.id, deactivate).await.unwrap();
    assert!(!registry.has_permission(&role.id, "expenses", "approve").await);
    assert!(registry.effective_permissions(&role.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_role_in_use_cannot_be_deleted() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "president").await;
    registry.seed_default_roles().await.unwrap();
    let role = registry
        .create_role(calycompta_registry::models::CreateRoleRequest {
            name: "Moniteur".to_string(),
            description: String::new(),
            level: 0,
            color: String::new(),
            icon: String::new(),
            is_active: true,
            module_permissions: Default::default(),
            can_manage: Vec::new(),
        })
        .await
        .unwrap();

    registry.assign_member_role("diver-1", &role.id).await.unwrap();
    assert!(matches!(
        registry.delete_role(&role.id).await,
        Err(RegistryError::RoleInUse { members: 1, .. })
    ));

    registry.assign_member_role("diver-1", "user").await.unwrap();
    registry.delete_role(&role.id).await.unwrap();
    assert!(matches!(
        registry.get_role(&role.id).await,
        Err(RegistryError::UnknownRole(_))
    ));
}

#[tokio::test]
async fn test_user_permission_follows_member_role() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "president").await;
    install_all(&registry, &["expenses"]).await;
    registry.seed_default_roles().await.unwrap();
    registry
        .grant_permission("validateur", "expenses", "approve")
        .await
        .unwrap();

    assert!(!registry.user_has_permission("diver-1", "expenses", "approve").await.unwrap());

    registry.assign_member_role("diver-1", "validateur").await.unwrap();
    assert!(registry.user_has_permission("diver-1", "expenses", "approve").await.unwrap());
    assert_eq!(
        registry.member_role("diver-1").await.unwrap().as_deref(),
        Some("validateur")
    );

    assert!(matches!(
        registry.assign_member_role("diver-1", "ghost").await,
        Err(RegistryError::UnknownRole(_))
    ));
}

// ==================== 存储与降级 ====================

#[tokio::test]
async fn test_state_survives_reinitialization() {
    let (store, registry) = create_test_registry(TEST_CLUB, "president").await;
    install_all(&registry, &["expenses", "inventory"]).await;
    registry.disable("inventory").await.unwrap();
    registry.seed_default_roles().await.unwrap();
    registry
        .grant_permission("admin", "expenses", "configure")
        .await
        .unwrap();

    let reloaded = registry_over(store, TEST_CLUB, "president").await;
    assert!(!reloaded.is_degraded().await);
    assert!(reloaded.is_active("expenses").await);
    assert!(reloaded.is_installed("inventory").await);
    assert!(!reloaded.is_active("inventory").await);
    assert_eq!(reloaded.list_roles().await.len(), 5);
    assert!(reloaded.has_permission("admin", "expenses", "configure").await);
}

#[tokio::test]
async fn test_uninstall_archives_module_data() {
    let (store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    registry.install("inventory", None).await.unwrap();
    store
        .insert_module_document(TEST_CLUB, "inventory", "item-1", json!({"name": "Détendeur"}))
        .await;

    let archived = registry.uninstall("inventory").await.unwrap();
    assert!(archived >= 1);
    assert!(!registry.is_installed("inventory").await);
    assert!(store.archived_documents(TEST_CLUB, "inventory").await.contains_key("item-1"));
    assert!(store.module_documents(TEST_CLUB, "inventory").await.is_empty());
}

#[tokio::test]
async fn test_unreachable_store_starts_degraded() {
    let store = Arc::new(MemoryRegistryStore::new());
    store.set_unavailable(true);

    let registry = registry_over(store.clone(), TEST_CLUB, "tresorier").await;
    assert!(registry.is_degraded().await);
    assert!(registry.list_installed().await.is_empty());
    // 存储读取失败时目录回退到内置版本
    assert_eq!(registry.catalog().await.source(), "builtin");

    // 写入失败不会改变缓存
    assert!(matches!(
        registry.install("inventory", None).await,
        Err(RegistryError::Store(_))
    ));
    assert!(!registry.is_installed("inventory").await);

    store.set_unavailable(false);
    registry.install("inventory", None).await.unwrap();
    assert!(registry.is_installed("inventory").await);
    assert!(!registry.is_degraded().await);
}

#[tokio::test]
async fn test_degraded_club_reloads_before_mutating() {
    let (store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    registry.seed_default_roles().await.unwrap();
    let mut settings = registry.catalog().await.get("expenses").unwrap().default_settings();
    settings.insert("workflow.receiptThreshold".to_string(), json!(50));
    registry.install("expenses", Some(settings)).await.unwrap();
    registry
        .grant_permission("validateur", "expenses", "approve")
        .await
        .unwrap();

    // 重启时存储短暂不可达
    store.set_unavailable(true);
    let restarted = registry_over(store.clone(), TEST_CLUB, "tresorier").await;
    store.set_unavailable(false);
    assert!(restarted.is_degraded().await);
    assert!(restarted.list_roles().await.is_empty());

    assert!(restarted.seed_default_roles().await.unwrap().is_empty());
    assert!(matches!(
        restarted.install("expenses", None).await,
        Err(RegistryError::AlreadyInstalled(_))
    ));
    assert!(!restarted.is_degraded().await);
    assert_eq!(restarted.list_roles().await.len(), 5);

    let persisted = registry_over(store, TEST_CLUB, "tresorier").await;
    assert!(persisted
        .get_role("validateur")
        .await
        .unwrap()
        .holds("expenses", "approve"));
    assert_eq!(
        persisted
            .settings("expenses")
            .await
            .unwrap()
            .get("workflow.receiptThreshold"),
        Some(&json!(50))
    );
}

#[tokio::test]
async fn test_degraded_club_refuses_mutations_while_store_offline() {
    let (store, registry) = create_test_registry(TEST_CLUB, "tresorier").await;
    registry.seed_default_roles().await.unwrap();

    store.set_unavailable(true);
    let restarted = registry_over(store.clone(), TEST_CLUB, "tresorier").await;

    assert!(matches!(
        restarted.seed_default_roles().await,
        Err(RegistryError::Store(_))
    ));
    assert!(matches!(
        restarted.assign_member_role("u-1", "user").await,
        Err(RegistryError::Store(_))
    ));
    assert!(restarted.list_roles().await.is_empty());
    assert!(restarted.is_degraded().await);

    store.set_unavailable(false);
    assert_eq!(store.list_roles(TEST_CLUB).await.unwrap().len(), 5);
    restarted.assign_member_role("u-1", "user").await.unwrap();
}

#[tokio::test]
async fn test_no_catalog_source_starts_degraded() {
    let registry = registry_with_source(OfflineSource).await;

    assert!(registry.is_degraded().await);
    assert!(registry.catalog().await.is_empty());
    assert!(matches!(
        registry.install("expenses", None).await,
        Err(RegistryError::UnknownModule(_))
    ));
    assert!(matches!(
        registry.reload_catalog().await,
        Err(RegistryError::CatalogUnavailable(CatalogError::Exhausted))
    ));
}

#[tokio::test]
async fn test_published_catalog_is_preferred() {
    let store = Arc::new(MemoryRegistryStore::new());
    let mut modules = ModuleCatalog::builtin().unwrap().list_all().to_vec();
    modules.retain(|m| m.id != "inventory");
    store.replace_catalog(&modules).await.unwrap();

    let registry = registry_over(store, TEST_CLUB, "tresorier").await;
    let catalog = registry.catalog().await;
    assert_eq!(catalog.source(), "store");
    assert!(!catalog.contains("inventory"));
}

// ==================== 操作者与多俱乐部 ====================

#[tokio::test]
async fn test_acting_as_stamps_mutations() {
    let (_store, registry) = create_test_registry(TEST_CLUB, "system").await;

    let secretary = registry.acting_as(Arc::new(StaticIdentity::new("secretaire")));
    let instance = secretary.install("inventory", None).await.unwrap();
    assert_eq!(instance.installed_by, "secretaire");

    // 共享同一份缓存
    assert!(registry.is_installed("inventory").await);

    let instance = registry.get_instance("inventory").await.unwrap();
    assert_eq!(instance.installed_by, "secretaire");
    registry.disable("inventory").await.unwrap();
    let instance = registry.get_instance("inventory").await.unwrap();
    assert_eq!(instance.updated_by.as_deref(), Some("system"));
}

#[tokio::test]
async fn test_hub_isolates_clubs_and_shares_state() {
    let store = Arc::new(MemoryRegistryStore::new());
    let sources = calycompta_registry::services::default_sources(
        store.clone() as Arc<dyn RegistryStore>,
        None,
    );
    let hub = RegistryHub::new(store.clone(), sources, SettingValidators::with_builtins()).await;

    let calypso = hub.registry("calypso").await;
    calypso.install("inventory", None).await.unwrap();

    assert!(hub.registry("calypso").await.is_installed("inventory").await);
    assert!(!hub.registry("nautilus").await.is_installed("inventory").await);
    assert_eq!(hub.loaded_clubs(), 2);

    // 丢弃缓存后从存储重新加载
    assert!(hub.evict("calypso"));
    assert!(hub.registry("calypso").await.is_installed("inventory").await);
}

#[tokio::test]
async fn test_hub_recovers_club_loaded_during_outage() {
    let store = Arc::new(MemoryRegistryStore::new());
    let sources = calycompta_registry::services::default_sources(
        store.clone() as Arc<dyn RegistryStore>,
        None,
    );
    let hub = RegistryHub::new(store.clone(), sources, SettingValidators::with_builtins()).await;
    hub.registry("calypso")
        .await
        .install("inventory", None)
        .await
        .unwrap();
    assert!(hub.evict("calypso"));

    store.set_unavailable(true);
    let during = hub.registry("calypso").await;
    assert!(during.is_degraded().await);
    assert!(!during.is_installed("inventory").await);

    store.set_unavailable(false);
    let after = hub.registry("calypso").await;
    assert!(!after.is_degraded().await);
    assert!(after.is_installed("inventory").await);
    // 同一俱乐部的旧句柄共享恢复后的缓存
    assert!(during.is_installed("inventory").await);
    assert_eq!(hub.loaded_clubs(), 1);
}

fn non_core_catalog() -> Vec<ModuleDefinition> {
    ModuleCatalog::builtin()
        .unwrap()
        .list_all()
        .iter()
        .cloned()
        .map(|mut m| {
            m.is_core = false;
            m
        })
        .collect()
}
