use callback_proto::ContentKind;
use sqlx::FromRow;

use crate::{Store, StoreResult, SystemId};

/// A process start reported by an agent, with its time already skew
/// corrected.
#[derive(Debug, Clone)]
pub struct NewProcessEvent<'a> {
    pub system: SystemId,
    pub executable_id: i64,
    pub pid: i64,
    pub ppid: i64,
    pub path: &'a str,
    pub command_line: &'a str,
    pub event_time: i64,
}

/// One row of the content-on-system association.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Sighting {
    pub first_seen: i64,
    pub last_seen: i64,
    pub path: String,
}

impl Store {
    pub async fn record_process_event(&self, event: &NewProcessEvent<'_>) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO process_events (
                system_id, executable_file_id, pid, ppid, path, command_line, event_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            RETURNING id
            "#,
        )
        .bind(event.system.0)
        .bind(event.executable_id)
        .bind(event.pid)
        .bind(event.ppid)
        .bind(event.path)
        .bind(event.command_line)
        .bind(event.event_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn record_catalog_event(
        &self,
        system: SystemId,
        catalog_id: i64,
        path: &str,
        event_time: i64,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO catalog_events (system_id, catalog_file_id, path, event_time)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING id
            "#,
        )
        .bind(system.0)
        .bind(catalog_id)
        .bind(path)
        .bind(event_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Upserts the (content, system) association. Sightings may arrive out of
    /// order: the window only widens, and the path follows the latest one.
    pub async fn record_sighting(
        &self,
        kind: ContentKind,
        content_id: i64,
        system: SystemId,
        seen_at: i64,
        path: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file_seen_on_system (kind, content_id, system_id, first_seen, last_seen, path)
            VALUES (?1, ?2, ?3, ?4, ?4, ?5)
            ON CONFLICT (kind, content_id, system_id) DO UPDATE SET
                path = CASE
                    WHEN excluded.last_seen >= file_seen_on_system.last_seen THEN excluded.path
                    ELSE file_seen_on_system.path
                END,
                first_seen = MIN(file_seen_on_system.first_seen, excluded.first_seen),
                last_seen = MAX(file_seen_on_system.last_seen, excluded.last_seen)
            "#,
        )
        .bind(kind.tag())
        .bind(content_id)
        .bind(system.0)
        .bind(seen_at)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sighting(
        &self,
        kind: ContentKind,
        content_id: i64,
        system: SystemId,
    ) -> StoreResult<Option<Sighting>> {
        let sighting: Option<Sighting> = sqlx::query_as(
            r#"
            SELECT first_seen, last_seen, path FROM file_seen_on_system
            WHERE kind = ?1 AND content_id = ?2 AND system_id = ?3
            "#,
        )
        .bind(kind.tag())
        .bind(content_id)
        .bind(system.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sighting)
    }
}
