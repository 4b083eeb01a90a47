use callback_proto::{ContentKind, Md5Digest, ResponseToAgent, Sha1Digest, Sha256Digest};
use sqlx::{FromRow, SqliteConnection};
use tracing::debug;

use crate::tasks::insert_task;
use crate::{Store, StoreError, StoreResult, SystemId};

pub(crate) fn table(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Executable => "executable_files",
        ContentKind::Catalog => "catalog_files",
    }
}

/// First sighting of a content object, as reported by an agent event.
#[derive(Debug, Clone)]
pub struct NewContent<'a> {
    pub kind: ContentKind,
    pub sha256: Sha256Digest,
    pub size: i64,
    pub first_seen: i64,
    pub path: &'a str,
    pub md5: Option<Md5Digest>,
    pub sha1: Option<Sha1Digest>,
    pub is_signed: bool,
}

/// Outcome of [`Store::register_content`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registered {
    pub id: i64,
    /// `false` when the digest was already known, including when a
    /// concurrent request inserted it first.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    pub id: i64,
    pub kind: ContentKind,
    pub sha256: Sha256Digest,
    pub size: i64,
    pub first_seen: i64,
    pub uploaded_at: Option<i64>,
    pub queued_at: Option<i64>,
    pub analyzed_at: Option<i64>,
}

#[derive(FromRow)]
struct ContentRow {
    id: i64,
    sha256: Vec<u8>,
    size: i64,
    first_seen: i64,
    uploaded_at: Option<i64>,
    queued_at: Option<i64>,
    analyzed_at: Option<i64>,
}

impl ContentRow {
    fn into_record(self, kind: ContentKind) -> StoreResult<ContentRecord> {
        let sha256 =
            Sha256Digest::from_slice("sha256", &self.sha256).map_err(|err| StoreError::Corrupt {
                table: table(kind),
                id: self.id,
                reason: err.to_string(),
            })?;
        Ok(ContentRecord {
            id: self.id,
            kind,
            sha256,
            size: self.size,
            first_seen: self.first_seen,
            uploaded_at: self.uploaded_at,
            queued_at: self.queued_at,
            analyzed_at: self.analyzed_at,
        })
    }
}

impl Store {
    /// Inserts the content object unless its digest is already present. The
    /// unique digest column decides races between concurrent reporters.
    pub async fn register_content(&self, new: &NewContent<'_>) -> StoreResult<Registered> {
        let mut conn = self.pool.acquire().await?;
        insert_content(&mut conn, new).await
    }

    /// Like [`Store::register_content`], but a newly created object also gets
    /// `fetch` queued for `system` in the same transaction. Either both rows
    /// land or neither does.
    pub async fn register_content_with_fetch(
        &self,
        system: SystemId,
        new: &NewContent<'_>,
        fetch: &ResponseToAgent,
        now: i64,
    ) -> StoreResult<Registered> {
        let mut tx = self.pool.begin().await?;
        let registered = insert_content(&mut tx, new).await?;
        if registered.created {
            insert_task(&mut tx, system, fetch, now).await?;
        }
        tx.commit().await?;
        Ok(registered)
    }

    pub async fn find_content(
        &self,
        kind: ContentKind,
        sha256: &Sha256Digest,
    ) -> StoreResult<Option<ContentRecord>> {
        let sql = format!(
            "SELECT id, sha256, size, first_seen, uploaded_at, queued_at, analyzed_at \
             FROM {} WHERE sha256 = ?1",
            table(kind)
        );
        let row: Option<ContentRow> = sqlx::query_as(&sql)
            .bind(sha256.as_bytes())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.into_record(kind)).transpose()
    }

    /// Sets the upload time if it is still unset. Returns whether this call
    /// set it.
    pub async fn mark_uploaded(&self, kind: ContentKind, id: i64, now: i64) -> StoreResult<bool> {
        self.set_once(kind, "uploaded_at", id, now).await
    }

    /// Sets the time the analysis job was accepted by the queue, if unset.
    pub async fn mark_queued(&self, kind: ContentKind, id: i64, now: i64) -> StoreResult<bool> {
        self.set_once(kind, "queued_at", id, now).await
    }

    async fn set_once(
        &self,
        kind: ContentKind,
        column: &'static str,
        id: i64,
        now: i64,
    ) -> StoreResult<bool> {
        let sql = format!(
            "UPDATE {table} SET {column} = ?2 WHERE id = ?1 AND {column} IS NULL",
            table = table(kind)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

async fn insert_content(
    conn: &mut SqliteConnection,
    new: &NewContent<'_>,
) -> StoreResult<Registered> {
    let digest = new.sha256.as_bytes();
    let inserted: Option<i64> = match new.kind {
        ContentKind::Executable => {
            sqlx::query_scalar(
                r#"
                INSERT INTO executable_files (sha256, md5, sha1, size, is_signed, first_seen)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (sha256) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(digest)
            .bind(new.md5.as_ref().map(|d| d.as_bytes()))
            .bind(new.sha1.as_ref().map(|d| d.as_bytes()))
            .bind(new.size)
            .bind(new.is_signed)
            .bind(new.first_seen)
            .fetch_optional(&mut *conn)
            .await?
        }
        ContentKind::Catalog => {
            sqlx::query_scalar(
                r#"
                INSERT INTO catalog_files (sha256, path, size, first_seen)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (sha256) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(digest)
            .bind(new.path)
            .bind(new.size)
            .bind(new.first_seen)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    if let Some(id) = inserted {
        debug!(kind = %new.kind, id, sha256 = %new.sha256, "new content object");
        return Ok(Registered { id, created: true });
    }

    let sql = format!("SELECT id FROM {} WHERE sha256 = ?1", table(new.kind));
    let id: i64 = sqlx::query_scalar(&sql)
        .bind(digest)
        .fetch_one(&mut *conn)
        .await?;
    Ok(Registered { id, created: false })
}
