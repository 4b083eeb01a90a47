use callback_proto::Registration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Store, StoreError, StoreResult, SystemId};

/// Every tenant gets its new systems filed under this set.
pub const DEFAULT_SYSTEM_SET: &str = "Default";

/// A v4 collision is astronomically unlikely; a few retries cover it.
pub const MAX_UUID_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredSystem {
    pub id: SystemId,
    pub uuid: Uuid,
}

impl Store {
    /// Resolves an agent's claimed identity. Malformed UUIDs and pairs that do
    /// not match a single system under that tenant all come back as `None`.
    pub async fn resolve_system(
        &self,
        system_uuid: &str,
        tenant_uuid: &str,
    ) -> StoreResult<Option<SystemId>> {
        let (Ok(system), Ok(tenant)) = (Uuid::parse_str(system_uuid), Uuid::parse_str(tenant_uuid))
        else {
            return Ok(None);
        };

        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT systems.id
            FROM systems
            JOIN system_sets ON system_sets.id = systems.system_set_id
            JOIN tenants ON tenants.id = system_sets.tenant_id
            WHERE systems.uuid = ?1 AND tenants.uuid = ?2
            "#,
        )
        .bind(system.as_bytes().as_slice())
        .bind(tenant.as_bytes().as_slice())
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(SystemId))
    }

    pub async fn insert_tenant(&self, uuid: Uuid, name: &str, now: i64) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO tenants (uuid, name, created_at) VALUES (?1, ?2, ?3) RETURNING id",
        )
        .bind(uuid.as_bytes().as_slice())
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Creates a system for `tenant` with a freshly generated UUID. Returns
    /// `None` when the tenant does not exist.
    pub async fn register_system(
        &self,
        tenant: Uuid,
        details: &Registration,
        now: i64,
    ) -> StoreResult<Option<RegisteredSystem>> {
        self.register_system_with(tenant, details, now, Uuid::new_v4)
            .await
    }

    pub async fn register_system_with(
        &self,
        tenant: Uuid,
        details: &Registration,
        now: i64,
        mut next_uuid: impl FnMut() -> Uuid + Send,
    ) -> StoreResult<Option<RegisteredSystem>> {
        let tenant_id: Option<i64> = sqlx::query_scalar("SELECT id FROM tenants WHERE uuid = ?1")
            .bind(tenant.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;
        let Some(tenant_id) = tenant_id else {
            return Ok(None);
        };

        let system_set_id = self.default_system_set(tenant_id, now).await?;

        for attempt in 1..=MAX_UUID_ATTEMPTS {
            let uuid = next_uuid();
            let inserted: Result<i64, sqlx::Error> = sqlx::query_scalar(
                r#"
                INSERT INTO systems (
                    system_set_id, uuid, agent_version, os_human_name, os_version,
                    manufacturer, model, arch, machine_name, machine_guid,
                    first_seen, last_seen
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                RETURNING id
                "#,
            )
            .bind(system_set_id)
            .bind(uuid.as_bytes().as_slice())
            .bind(&details.agent_version)
            .bind(&details.os_human_name)
            .bind(&details.os_version)
            .bind(&details.manufacturer)
            .bind(&details.model)
            .bind(&details.arch)
            .bind(&details.machine_name)
            .bind(&details.machine_guid)
            .bind(now)
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok(id) => {
                    debug!(system_id = id, %uuid, "registered system");
                    return Ok(Some(RegisteredSystem {
                        id: SystemId(id),
                        uuid,
                    }));
                }
                Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                    warn!(attempt, %uuid, "system uuid collision, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(StoreError::UuidExhausted(MAX_UUID_ATTEMPTS))
    }

    /// Records contact from an agent. Never moves `last_seen` backwards.
    pub async fn touch_system(&self, system: SystemId, now: i64) -> StoreResult<()> {
        sqlx::query("UPDATE systems SET last_seen = MAX(last_seen, ?2) WHERE id = ?1")
            .bind(system.0)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_seen(&self, system: SystemId) -> StoreResult<Option<i64>> {
        let seen: Option<i64> = sqlx::query_scalar("SELECT last_seen FROM systems WHERE id = ?1")
            .bind(system.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(seen)
    }

    /// Find-or-create in one statement pair; the unique `(tenant_id, name)`
    /// index makes concurrent first registrations converge on one row.
    async fn default_system_set(&self, tenant_id: i64, now: i64) -> StoreResult<i64> {
        sqlx::query(
            r#"
            INSERT INTO system_sets (tenant_id, name, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT (tenant_id, name) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(DEFAULT_SYSTEM_SET)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM system_sets WHERE tenant_id = ?1 AND name = ?2")
            .bind(tenant_id)
            .bind(DEFAULT_SYSTEM_SET)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }
}
