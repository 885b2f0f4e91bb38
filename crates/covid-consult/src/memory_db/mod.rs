//! Graph memory store: users, messages and the derived profile graph,
//! persisted in SQLite.
//!
//! Graph nodes are tables and relationships are edge tables keyed by the
//! pair they connect, so `INSERT OR IGNORE` gives MERGE semantics. Every
//! public write runs in its own `BEGIN IMMEDIATE` transaction; writers to the
//! same user queue behind SQLite's write lock instead of interleaving.

pub mod conversation_store;
pub mod migration;
pub mod profile_store;
pub mod schema;
pub mod user_store;

pub use conversation_store::ConversationStore;
pub use migration::MigrationManager;
pub use profile_store::{merge_field, normalize_name, ProfileStore};
pub use schema::*;
pub use user_store::UserStore;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::StoreError;

pub type DbPool = Pool<SqliteConnectionManager>;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

pub struct MemoryDatabase {
    pub users: UserStore,
    pub conversations: ConversationStore,
    pub profiles: ProfileStore,
    pool: Arc<DbPool>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        info!("Memory database initialized successfully");
        Ok(Self::from_pool(pool))
    }

    /// Single-connection in-memory database; every pooled connection to
    /// `:memory:` would otherwise be a separate empty database.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: DbPool) -> Self {
        let pool = Arc::new(pool);
        Self {
            users: UserStore::new(Arc::clone(&pool)),
            conversations: ConversationStore::new(Arc::clone(&pool)),
            profiles: ProfileStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, StoreError> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction. The transaction rolls back
/// when `f` fails.
pub(crate) fn write_tx<T, F>(pool: &DbPool, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
{
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Fail with `UnknownUser` unless `user_id` names an existing user.
pub(crate) fn require_user(conn: &rusqlite::Connection, user_id: &str) -> Result<(), StoreError> {
    conn.query_row("SELECT 1 FROM users WHERE id = ?1", [user_id], |_| Ok(()))
        .optional()?
        .ok_or_else(|| StoreError::UnknownUser(user_id.to_string()))
}
