//! Durable state shared by every callback server instance.
//!
//! Writes that can race between concurrent requests rely on the database:
//! dedup on the `UNIQUE (sha256)` constraints and task delivery on a
//! conditional `UPDATE ... RETURNING`. A new content object and its fetch
//! task commit together in one transaction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use callback_proto::ProtoError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

pub mod content;
pub mod events;
pub mod identity;
pub mod tasks;
pub mod updates;

pub use content::{ContentRecord, NewContent, Registered};
pub use events::{NewProcessEvent, Sighting};
pub use identity::{RegisteredSystem, MAX_UUID_ATTEMPTS};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("could not encode task: {0}")]
    Encode(#[from] ProtoError),

    #[error("corrupt {table} row {id}: {reason}")]
    Corrupt {
        table: &'static str,
        id: i64,
        reason: String,
    },

    #[error("no free system uuid after {0} attempts")]
    UuidExhausted(usize),
}

/// Internal numeric identity of a registered agent installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(pub i64);

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection pool plus the operations the server performs on it.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database at `url` and applies
    /// pending migrations.
    pub async fn open(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        Self::connect(options, max_connections).await
    }

    pub async fn connect(options: SqliteConnectOptions, max_connections: u32) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        sqlx::migrate!().run(&pool).await?;
        debug!(max_connections, "store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for checked-out connections to return, then closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
