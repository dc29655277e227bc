//! SQLite-backed storage for users, chat sessions, messages and uploaded files
pub mod file_store;
pub mod message_store;
pub mod migration;
pub mod schema;
pub mod session_store;
pub mod user_store;

pub use file_store::FileStore;
pub use message_store::MessageStore;
pub use migration::MigrationManager;
pub use schema::*;
pub use session_store::SessionStore;
pub use user_store::UserStore;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

pub struct ChatDatabase {
    pub users: UserStore,
    pub sessions: SessionStore,
    pub messages: MessageStore,
    pub files: FileStore,
    pool: DbPool,
}

impl ChatDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening chat database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
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
        info!("Chat database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Every pooled connection to `:memory:` opens its own database, so the pool holds one.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            users: UserStore::new(Arc::clone(&pool)),
            sessions: SessionStore::new(Arc::clone(&pool)),
            messages: MessageStore::new(Arc::clone(&pool)),
            files: FileStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = get_conn(&self.pool)?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

impl Drop for ChatDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

pub(crate) fn get_conn(pool: &DbPool) -> anyhow::Result<DbConn> {
    pool.get()
        .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
}

/// Fixed-precision RFC 3339 so stored timestamps sort as text.
pub(crate) fn now_string() -> String {
    format_datetime(Utc::now())
}

pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

pub(crate) fn parse_datetime_or_now(datetime_str: &str, column: &str) -> DateTime<Utc> {
    parse_datetime_safe(datetime_str).unwrap_or_else(|| {
        tracing::warn!("Failed to parse {} '{}'", column, datetime_str);
        Utc::now()
    })
}
