use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{migrate::MigrateDatabase, Result, Sqlite, SqlitePool, Transaction};
use tracing::{error, info, warn};

/// Per-collection schema versions. Blobs moved to version 2 when segment
/// bytes left the database for the file system, leaving `audio_blobs` as a
/// metadata-only collection.
pub const SESSIONS_SCHEMA_VERSION: i64 = 1;
pub const SETTINGS_SCHEMA_VERSION: i64 = 1;
pub const BLOBS_SCHEMA_VERSION: i64 = 2;
pub const RECOVERY_SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent_dir) = Path::new(db_path).parent() {
            if !parent_dir.exists() {
                fs::create_dir_all(parent_dir).map_err(sqlx::Error::Io)?;
            }
        }

        if !Path::new(db_path).exists() {
            info!("Creating database at {}", db_path);
            Sqlite::create_database(db_path).await?;
        }

        let pool = SqlitePool::connect(db_path).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        run_migrations(&pool).await?;

        Ok(DatabaseManager { pool })
    }

    /// Open with WAL recovery: a crash can leave an orphaned WAL
    /// file behind that makes the database look corrupted. Remove the WAL
    /// and SHM files and retry once before giving up.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let path_str = db_path.to_string_lossy().to_string();

        match Self::new(&path_str).await {
            Ok(manager) => Ok(manager),
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("malformed") && !error_msg.contains("corrupt") {
                    error!("Database connection failed: {}", error_msg);
                    return Err(e);
                }

                warn!(
                    "Database appears corrupted, likely due to an orphaned WAL file. Attempting recovery: {}",
                    error_msg
                );

                let wal_path = PathBuf::from(format!("{path_str}-wal"));
                let shm_path = PathBuf::from(format!("{path_str}-shm"));
                for stale in [&wal_path, &shm_path] {
                    if stale.exists() {
                        match fs::remove_file(stale) {
                            Ok(_) => info!("Removed orphaned file: {:?}", stale),
                            Err(e) => warn!("Failed to remove {:?}: {}", stale, e),
                        }
                    }
                }

                info!("Retrying database connection after WAL cleanup...");
                match Self::new(&path_str).await {
                    Ok(manager) => {
                        info!("Database opened successfully after WAL recovery");
                        Ok(manager)
                    }
                    Err(retry_err) => {
                        error!(
                            "Database connection failed even after WAL cleanup: {}",
                            retry_err
                        );
                        Err(retry_err)
                    }
                }
            }
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        for<'c> F: FnOnce(
            &'c mut Transaction<'static, Sqlite>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T>> + Send + 'c>,
        >,
    {
        let mut tx = self.pool.begin().await?;
        let result = f(&mut tx).await;

        match result {
            Ok(val) => {
                tx.commit().await?;
                Ok(val)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    /// Checkpoint the WAL into the main file and close the pool. Called on
    /// host shutdown.
    pub async fn cleanup(&self) -> Result<()> {
        match sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            Ok(_) => info!("WAL checkpoint completed"),
            Err(e) => warn!("WAL checkpoint failed (non-fatal): {}", e),
        }

        self.pool.close().await;
        info!("Database connection pool closed");
        Ok(())
    }
}

async fn collection_version(pool: &SqlitePool, collection: &str) -> Result<i64> {
    let version: Option<(i64,)> =
        sqlx::query_as("SELECT version FROM collection_versions WHERE collection = ?")
            .bind(collection)
            .fetch_optional(pool)
            .await?;
    Ok(version.map(|(v,)| v).unwrap_or(0))
}

async fn set_collection_version(pool: &SqlitePool, collection: &str, version: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO collection_versions (collection, version) VALUES (?, ?)
         ON CONFLICT(collection) DO UPDATE SET version = excluded.version",
    )
    .bind(collection)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(())
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS collection_versions (
            collection TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    if collection_version(pool, "sessions").await? < SESSIONS_SCHEMA_VERSION {
        migrate_sessions_v1(pool).await?;
        set_collection_version(pool, "sessions", SESSIONS_SCHEMA_VERSION).await?;
    }
    if collection_version(pool, "settings").await? < SETTINGS_SCHEMA_VERSION {
        migrate_settings_v1(pool).await?;
        set_collection_version(pool, "settings", SETTINGS_SCHEMA_VERSION).await?;
    }
    if collection_version(pool, "blobs").await? < BLOBS_SCHEMA_VERSION {
        migrate_blobs_v2(pool).await?;
        set_collection_version(pool, "blobs", BLOBS_SCHEMA_VERSION).await?;
    }
    if collection_version(pool, "recovery").await? < RECOVERY_SCHEMA_VERSION {
        migrate_recovery_v1(pool).await?;
        set_collection_version(pool, "recovery", RECOVERY_SCHEMA_VERSION).await?;
    }

    Ok(())
}

async fn migrate_sessions_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            duration_seconds REAL NOT NULL DEFAULT 0,
            file_size_bytes INTEGER NOT NULL DEFAULT 0,
            format TEXT NOT NULL,
            quality_kbps INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS segments (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            sequence_index INTEGER NOT NULL,
            path TEXT NOT NULL,
            display_name TEXT NOT NULL,
            duration_seconds REAL NOT NULL,
            file_size_bytes INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(session_id, sequence_index)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_session ON segments(session_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS session_notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            note TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_notes_session ON session_notes(session_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS session_tags (
            session_id TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (session_id, tag)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn migrate_settings_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn migrate_blobs_v2(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS audio_blobs (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn migrate_recovery_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS recovery (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}
