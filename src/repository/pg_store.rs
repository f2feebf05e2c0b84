//! PostgreSQL 文档存储
//! 每个注册表文档以 JSONB 存放，主键即逻辑文档路径

use super::{RegistryStore, StoreResult};
use crate::error::StoreError;
use crate::models::{ModularRole, ModuleDefinition, ModuleInstance};
use async_trait::async_trait;
use sqlx::{types::Json, PgPool, Row};

pub struct PgRegistryStore {
    db: PgPool,
}

impl PgRegistryStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    // ==================== Catalog ====================

    async fn load_catalog(&self) -> StoreResult<Vec<ModuleDefinition>> {
        let rows = sqlx::query("SELECT document FROM module_definitions ORDER BY position")
            .fetch_all(&self.db)
            .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<ModuleDefinition> {
                let Json(module) = row.try_get::<Json<ModuleDefinition>, _>("document")?;
                Ok(module)
            })
            .collect()
    }

    async fn replace_catalog(&self, modules: &[ModuleDefinition]) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM module_definitions")
            .execute(&mut *tx)
            .await?;

        for (position, module) in modules.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO module_definitions (module_id, position, document, published_at)
                VALUES ($1, $2, $3, NOW())
                "#,
            )
            .bind(&module.id)
            .bind(position as i32)
            .bind(Json(module))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(modules = modules.len(), "Module catalog published");
        Ok(())
    }

    // ==================== Module instances ====================

    async fn list_instances(&self, club_id: &str) -> StoreResult<Vec<ModuleInstance>> {
        let rows = sqlx::query(
            "SELECT document FROM club_module_instances WHERE club_id = $1 ORDER BY module_id",
        )
        .bind(club_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<ModuleInstance> {
                let Json(instance) = row.try_get::<Json<ModuleInstance>, _>("document")?;
                Ok(instance)
            })
            .collect()
    }

    async fn put_instance(&self, instance: &ModuleInstance) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO club_module_instances (club_id, module_id, document, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (club_id, module_id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            "#,
        )
        .bind(&instance.club_id)
        .bind(&instance.module_id)
        .bind(Json(instance))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn insert_instance(&self, instance: &ModuleInstance) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO club_module_instances (club_id, module_id, document, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (club_id, module_id) DO NOTHING
            "#,
        )
        .bind(&instance.club_id)
        .bind(&instance.module_id)
        .bind(Json(instance))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "module instance {}/{}",
                instance.club_id, instance.module_id
            )));
        }

        // 上次安装遗留的元数据直接覆盖
        sqlx::query(
            r#"
            INSERT INTO club_module_data (club_id, module_id, doc_id, document, created_at)
            VALUES ($1, $2, 'metadata', jsonb_build_object(
                'created_at', NOW(),
                'version', '1.0.0',
                'schema_version', 1
            ), NOW())
            ON CONFLICT (club_id, module_id, doc_id)
            DO UPDATE SET document = EXCLUDED.document, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&instance.club_id)
        .bind(&instance.module_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn archive_and_remove_module(&self, club_id: &str, module_id: &str) -> StoreResult<u64> {
        let mut tx = self.db.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT INTO club_archived_module_data (club_id, module_id, doc_id, document, archived_at)
            SELECT club_id, module_id, doc_id, document, NOW()
            FROM club_module_data
            WHERE club_id = $1 AND module_id = $2
            ON CONFLICT (club_id, module_id, doc_id)
            DO UPDATE SET document = EXCLUDED.document, archived_at = EXCLUDED.archived_at
            "#,
        )
        .bind(club_id)
        .bind(module_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM club_module_data WHERE club_id = $1 AND module_id = $2")
            .bind(club_id)
            .bind(module_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM club_module_instances WHERE club_id = $1 AND module_id = $2")
            .bind(club_id)
            .bind(module_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(moved)
    }

    // ==================== Roles ====================

    async fn list_roles(&self, club_id: &str) -> StoreResult<Vec<ModularRole>> {
        let rows = sqlx::query("SELECT document FROM club_roles WHERE club_id = $1 ORDER BY role_id")
            .bind(club_id)
            .fetch_all(&self.db)
            .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<ModularRole> {
                let Json(role) = row.try_get::<Json<ModularRole>, _>("document")?;
                Ok(role)
            })
            .collect()
    }

    async fn put_role(&self, role: &ModularRole) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO club_roles (club_id, role_id, document, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (club_id, role_id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            "#,
        )
        .bind(&role.club_id)
        .bind(&role.id)
        .bind(Json(role))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn insert_roles(&self, roles: &[ModularRole]) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;

        for role in roles {
            let inserted = sqlx::query(
                r#"
                INSERT INTO club_roles (club_id, role_id, document, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (club_id, role_id) DO NOTHING
                "#,
            )
            .bind(&role.club_id)
            .bind(&role.id)
            .bind(Json(role))
            .execute(&mut *tx)
            .await?
            .rows_affected();

            // 事务未提交，drop 时整体回滚
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("role {}/{}", role.club_id, role.id)));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_role(&self, club_id: &str, role_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM club_roles WHERE club_id = $1 AND role_id = $2")
            .bind(club_id)
            .bind(role_id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    // ==================== Members ====================

    async fn member_role(&self, club_id: &str, user_id: &str) -> StoreResult<Option<String>> {
        let role_id = sqlx::query_scalar::<_, String>(
            "SELECT role_id FROM club_members WHERE club_id = $1 AND user_id = $2",
        )
        .bind(club_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(role_id)
    }

    async fn set_member_role(
        &self,
        club_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO club_members (club_id, user_id, role_id, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (club_id, user_id)
            DO UPDATE SET role_id = EXCLUDED.role_id, updated_at = NOW()
            "#,
        )
        .bind(club_id)
        .bind(user_id)
        .bind(role_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn count_members_with_role(&self, club_id: &str, role_id: &str) -> StoreResult<u64> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) FROM club_members WHERE club_id = $1 AND role_id = $2",
        )
        .bind(club_id)
        .bind(role_id)
        .fetch_one(&self.db)
        .await?
        .get(0);

        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.db).await?;
        Ok(())
    }
}
