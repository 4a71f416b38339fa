use sqlx::{Error as SqlxError, SqlitePool};
use tracing::warn;

use crate::settings::Settings;

pub struct SettingsRepository;

impl SettingsRepository {
    /// Full settings snapshot: defaults applied for missing keys, unknown
    /// keys preserved in `extra`.
    pub async fn get_settings(pool: &SqlitePool) -> Result<Settings, SqlxError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM settings").fetch_all(pool).await?;

        let entries = rows.into_iter().filter_map(|(key, raw)| {
            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => Some((key, value)),
                Err(e) => {
                    warn!("Ignoring malformed setting '{}': {}", key, e);
                    None
                }
            }
        });

        Ok(Settings::from_entries(entries))
    }

    /// Write one setting in its own transaction. Alias keys (`format`,
    /// `quality`) fan out to both spellings; unrecognized keys are stored
    /// verbatim for forward compatibility.
    pub async fn put_setting(
        pool: &SqlitePool,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), SqlxError> {
        let raw = value.to_string();
        let targets = Settings::keys_for_write(key);

        let mut transaction = pool.begin().await?;
        if targets.is_empty() {
            upsert(&mut transaction, key, &raw).await?;
        } else {
            for target in targets {
                upsert(&mut transaction, target, &raw).await?;
            }
        }
        transaction.commit().await?;
        Ok(())
    }

    /// Commit a multi-key update on a single transaction so readers never
    /// observe a half-applied batch.
    pub async fn update_settings<I>(pool: &SqlitePool, updates: I) -> Result<(), SqlxError>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let mut transaction = pool.begin().await?;
        for (key, value) in updates {
            let raw = value.to_string();
            let targets = Settings::keys_for_write(&key);
            if targets.is_empty() {
                upsert(&mut transaction, &key, &raw).await?;
            } else {
                for target in targets {
                    upsert(&mut transaction, target, &raw).await?;
                }
            }
        }
        transaction.commit().await?;
        Ok(())
    }

    /// Persist a whole snapshot (canonical keys, aliases, and extras).
    pub async fn put_all(pool: &SqlitePool, settings: &Settings) -> Result<(), SqlxError> {
        let mut transaction = pool.begin().await?;
        for (key, value) in settings.to_entries() {
            upsert(&mut transaction, &key, &value.to_string()).await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    pub async fn clear_settings(pool: &SqlitePool) -> Result<(), SqlxError> {
        sqlx::query("DELETE FROM settings").execute(pool).await?;
        Ok(())
    }
}

async fn upsert(
    transaction: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &str,
    raw: &str,
) -> Result<(), SqlxError> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(raw)
    .execute(&mut **transaction)
    .await?;
    Ok(())
}
