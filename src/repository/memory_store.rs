//! 进程内文档存储
//! 用于测试与本地运行（`REGISTRY_REGISTRY__STORE=memory`）

use super::{RegistryStore, StoreResult};
use crate::error::StoreError;
use crate::models::{ModularRole, ModuleDefinition, ModuleInstance};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

type ClubKey = (String, String);

#[derive(Default)]
struct Documents {
    catalog: Vec<ModuleDefinition>,
    instances: BTreeMap<ClubKey, ModuleInstance>,
    roles: BTreeMap<ClubKey, ModularRole>,
    members: BTreeMap<ClubKey, String>,
    module_data: BTreeMap<ClubKey, BTreeMap<String, Value>>,
    archived_data: BTreeMap<ClubKey, BTreeMap<String, Value>>,
}

#[derive(Default)]
pub struct MemoryRegistryStore {
    docs: Mutex<Documents>,
    unavailable: AtomicBool,
    failing_instance_writes: AtomicBool,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储不可达，之后所有调用都返回 `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 模拟实例表写入失败（其余文档照常可写），用于验证批次原子性
    pub fn fail_instance_writes(&self, failing: bool) {
        self.failing_instance_writes.store(failing, Ordering::SeqCst);
    }

    /// 直接写入模块业务文档（测试用）
    pub async fn insert_module_document(
        &self,
        club_id: &str,
        module_id: &str,
        doc_id: &str,
        document: Value,
    ) {
        let mut docs = self.docs.lock().await;
        docs.module_data
            .entry(key(club_id, module_id))
            .or_default()
            .insert(doc_id.to_string(), document);
    }

    pub async fn module_documents(&self, club_id: &str, module_id: &str) -> BTreeMap<String, Value> {
        let docs = self.docs.lock().await;
        docs.module_data
            .get(&key(club_id, module_id))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn archived_documents(
        &self,
        club_id: &str,
        module_id: &str,
    ) -> BTreeMap<String, Value> {
        let docs = self.docs.lock().await;
        docs.archived_data
            .get(&key(club_id, module_id))
            .cloned()
            .unwrap_or_default()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn check_instance_writable(&self) -> StoreResult<()> {
        if self.failing_instance_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "club_module_instances rejected the write".to_string(),
            ));
        }
        Ok(())
    }
}

fn key(club_id: &str, id: &str) -> ClubKey {
    (club_id.to_string(), id.to_string())
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn load_catalog(&self) -> StoreResult<Vec<ModuleDefinition>> {
        self.check_available()?;
        Ok(self.docs.lock().await.catalog.clone())
    }

    async fn replace_catalog(&self, modules: &[ModuleDefinition]) -> StoreResult<()> {
        self.check_available()?;
        self.docs.lock().await.catalog = modules.to_vec();
        Ok(())
    }

    async fn list_instances(&self, club_id: &str) -> StoreResult<Vec<ModuleInstance>> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        Ok(docs
            .instances
            .iter()
            .filter(|((club, _), _)| club == club_id)
            .map(|(_, instance)| instance.clone())
            .collect())
    }

    async fn put_instance(&self, instance: &ModuleInstance) -> StoreResult<()> {
        self.check_available()?;
        self.check_instance_writable()?;
        self.docs
            .lock()
            .await
            .instances
            .insert(key(&instance.club_id, &instance.module_id), instance.clone());
        Ok(())
    }

    async fn insert_instance(&self, instance: &ModuleInstance) -> StoreResult<()> {
        self.check_available()?;
        let mut docs = self.docs.lock().await;
        let k = key(&instance.club_id, &instance.module_id);
        if docs.instances.contains_key(&k) {
            return Err(StoreError::Conflict(format!(
                "module instance {}/{}",
                instance.club_id, instance.module_id
            )));
        }

        let metadata = json!({
            "created_at": chrono::Utc::now(),
            "version": "1.0.0",
            "schema_version": 1,
        });

        // 两个写入都准备好后才一起落到文档上
        self.check_instance_writable()?;
        docs.module_data
            .entry(k.clone())
            .or_default()
            .insert("metadata".to_string(), metadata);
        docs.instances.insert(k, instance.clone());
        Ok(())
    }

    async fn archive_and_remove_module(&self, club_id: &str, module_id: &str) -> StoreResult<u64> {
        self.check_available()?;
        let mut docs = self.docs.lock().await;
        let k = key(club_id, module_id);

        self.check_instance_writable()?;
        docs.instances.remove(&k);
        let Some(data) = docs.module_data.remove(&k) else {
            return Ok(0);
        };
        let moved = data.len() as u64;
        docs.archived_data.entry(k).or_default().extend(data);
        Ok(moved)
    }

    async fn list_roles(&self, club_id: &str) -> StoreResult<Vec<ModularRole>> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        Ok(docs
            .roles
            .iter()
            .filter(|((club, _), _)| club == club_id)
            .map(|(_, role)| role.clone())
            .collect())
    }

    async fn put_role(&self, role: &ModularRole) -> StoreResult<()> {
        self.check_available()?;
        self.docs
            .lock()
            .await
            .roles
            .insert(key(&role.club_id, &role.id), role.clone());
        Ok(())
    }

    async fn insert_roles(&self, roles: &[ModularRole]) -> StoreResult<()> {
        self.check_available()?;
        let mut docs = self.docs.lock().await;
        if let Some(existing) = roles
            .iter()
            .find(|role| docs.roles.contains_key(&key(&role.club_id, &role.id)))
        {
            return Err(StoreError::Conflict(format!(
                "role {}/{}",
                existing.club_id, existing.id
            )));
        }
        for role in roles {
            docs.roles.insert(key(&role.club_id, &role.id), role.clone());
        }
        Ok(())
    }

    async fn delete_role(&self, club_id: &str, role_id: &str) -> StoreResult<()> {
        self.check_available()?;
        self.docs.lock().await.roles.remove(&key(club_id, role_id));
        Ok(())
    }

    async fn member_role(&self, club_id: &str, user_id: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.docs.lock().await.members.get(&key(club_id, user_id)).cloned())
    }

    async fn set_member_role(
        &self,
        club_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> StoreResult<()> {
        self.check_available()?;
        self.docs
            .lock()
            .await
            .members
            .insert(key(club_id, user_id), role_id.to_string());
        Ok(())
    }

    async fn count_members_with_role(&self, club_id: &str, role_id: &str) -> StoreResult<u64> {
        self.check_available()?;
        let docs = self.docs.lock().await;
        Ok(docs
            .members
            .iter()
            .filter(|((club, _), role)| club == club_id && role.as_str() == role_id)
            .count() as u64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.check_available()
    }
}
