use callback_proto::ResponseToAgent;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::{Store, StoreResult, SystemId};

impl Store {
    /// Appends a command to the system's backlog. The encoded form is stored
    /// and later sent back verbatim.
    pub async fn enqueue_task(
        &self,
        system: SystemId,
        command: &ResponseToAgent,
        now: i64,
    ) -> StoreResult<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut conn, system, command, now).await
    }

    /// Claims the oldest undelivered task of the system and returns its
    /// stored body. Select and mark happen in one statement, so two
    /// concurrent check-ins never receive the same task.
    pub async fn next_pending(&self, system: SystemId, now: i64) -> StoreResult<Option<String>> {
        let claimed: Option<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE tasks SET delivered_at = ?2
            WHERE id = (
                SELECT id FROM tasks
                WHERE system_id = ?1 AND delivered_at IS NULL
                ORDER BY created_at, id
                LIMIT 1
            )
            AND delivered_at IS NULL
            RETURNING id, command
            "#,
        )
        .bind(system.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|(id, command)| {
            debug!(%system, task_id = id, "task delivered");
            command
        }))
    }

    /// Undelivered task bodies, oldest first.
    pub async fn pending_tasks(&self, system: SystemId) -> StoreResult<Vec<String>> {
        let bodies: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT command FROM tasks
            WHERE system_id = ?1 AND delivered_at IS NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(system.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(bodies)
    }
}

pub(crate) async fn insert_task(
    conn: &mut SqliteConnection,
    system: SystemId,
    command: &ResponseToAgent,
    now: i64,
) -> StoreResult<i64> {
    let body = command.encode()?;
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO tasks (system_id, created_at, command) VALUES (?1, ?2, ?3) RETURNING id",
    )
    .bind(system.0)
    .bind(now)
    .bind(&body)
    .fetch_one(&mut *conn)
    .await?;
    debug!(%system, task_id = id, command = command.name(), "task enqueued");
    Ok(id)
}
