use sqlx::SqlitePool;
use tracing::warn;

use crate::database::models::RecoveryCheckpoint;
use crate::error::StorageError;

/// Single-slot store for the live recording's checkpoint, keyed `current`.
/// The payload is a JSON document; timestamps serialize as ISO-8601 strings
/// and are restored on load.
#[derive(Clone)]
pub struct RecoveryStore {
    pool: SqlitePool,
}

const SLOT_ID: &str = "current";

impl RecoveryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn put(&self, checkpoint: &RecoveryCheckpoint) -> Result<(), StorageError> {
        let payload = serde_json::to_string(checkpoint)
            .map_err(|e| StorageError::RecoveryStoreFailed(e.to_string()))?;

        sqlx::query(
            "INSERT INTO recovery (id, payload) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload",
        )
        .bind(SLOT_ID)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::RecoveryStoreFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn get(&self) -> Result<Option<RecoveryCheckpoint>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT payload FROM recovery WHERE id = ?")
            .bind(SLOT_ID)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::RecoveryStoreFailed(e.to_string()))?;

        match row {
            Some((payload,)) => match serde_json::from_str(&payload) {
                Ok(checkpoint) => Ok(Some(checkpoint)),
                Err(e) => {
                    // A checkpoint that no longer parses is useless; treat it
                    // as absent rather than wedging startup.
                    warn!("Discarding unreadable recovery checkpoint: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM recovery WHERE id = ?")
            .bind(SLOT_ID)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::RecoveryStoreFailed(e.to_string()))?;
        Ok(())
    }
}
