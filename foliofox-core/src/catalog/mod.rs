//! Catalog store: the single durable resource every subsystem shares.
//!
//! One SQLite file in WAL mode, foreign keys on. All writes go through the
//! typed repositories here; destructive maintenance acquires the exclusive
//! session so the queue engine can pause new starts while vacuum/reindex
//! run.

pub mod books;
pub mod health;
pub mod indexers;
pub mod logs;
pub mod maintenance;
pub mod migrations;
pub mod queue;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

use foliofox_config::DatabaseConfig;

use crate::error::Result;

pub use books::BookRepository;
pub use health::HealthRepository;
pub use indexers::IndexerRepository;
pub use logs::{LogLevel, LogRepository};
pub use maintenance::MaintenanceRepository;
pub use queue::QueueRepository;

/// Handle to the shared catalog database.
#[derive(Clone, Debug)]
pub struct CatalogStore {
    pool: SqlitePool,
    path: PathBuf,
    // Advisory discipline: short operations take read, vacuum/reindex take
    // write. Purely in-process; SQLite serializes actual writers itself.
    session_lock: Arc<RwLock<()>>,
}

impl CatalogStore {
    /// Open (creating if missing) the catalog, apply pending migrations,
    /// and verify the checksums of every previously applied one.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        info!(path = %config.path.display(), "connected to catalog");

        let store = Self {
            pool,
            path: config.path.clone(),
            session_lock: Arc::new(RwLock::new(())),
        };
        migrations::apply_pending(&store.pool).await?;
        migrations::verify_applied(&store.pool).await?;
        Ok(store)
    }

    /// In-memory catalog with the full schema, for tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        // One pinned connection: the database dies with it, so the pool
        // must never reap it as idle.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            path: PathBuf::from(":memory:"),
            session_lock: Arc::new(RwLock::new(())),
        };
        migrations::apply_pending(&store.pool).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path of the catalog file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Short-transaction permit. Held only for the duration of one logical
    /// mutation; blocks while an exclusive session is active.
    pub async fn shared_session(&self) -> RwLockReadGuard<'_, ()> {
        self.session_lock.read().await
    }

    /// Exclusive session for destructive maintenance (vacuum/reindex).
    /// While held, no new shared session can begin.
    pub async fn exclusive_session(&self) -> RwLockWriteGuard<'_, ()> {
        self.session_lock.write().await
    }

    /// Whether an exclusive maintenance session is currently active.
    pub fn exclusive_session_active(&self) -> bool {
        self.session_lock.try_read().is_err()
    }

    pub fn books(&self) -> BookRepository {
        BookRepository::new(self.pool.clone())
    }

    pub fn indexers(&self) -> IndexerRepository {
        IndexerRepository::new(self.pool.clone())
    }

    pub fn queue(&self) -> QueueRepository {
        QueueRepository::new(self.pool.clone())
    }

    pub fn health(&self) -> HealthRepository {
        HealthRepository::new(self.pool.clone())
    }

    pub fn logs(&self) -> LogRepository {
        LogRepository::new(self.pool.clone())
    }

    pub fn maintenance(&self) -> MaintenanceRepository {
        MaintenanceRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
