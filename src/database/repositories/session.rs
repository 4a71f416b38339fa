use chrono::Utc;
use sqlx::{Error as SqlxError, SqlitePool};
use tracing::{error, info};

use crate::database::models::{
    millis_to_utc, Note, NoteRow, SegmentRef, SegmentRow, Session, SessionId, SessionMetadata,
    SessionRow,
};
use crate::validation::MAX_TAGS_PER_SESSION;

/// Outcome of a transactional tag union.
#[derive(Debug, PartialEq, Eq)]
pub enum TagWriteOutcome {
    Applied,
    SessionMissing,
    TooManyTags,
}

pub struct SessionsRepository;

impl SessionsRepository {
    /// Insert or update the session record. Segment rows are written
    /// separately through [`SessionsRepository::append_segment`].
    pub async fn upsert_session(
        pool: &SqlitePool,
        id: SessionId,
        created_at_ms: i64,
        metadata: &SessionMetadata,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, created_at, start_time, duration_seconds, file_size_bytes, format, quality_kbps)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                duration_seconds = excluded.duration_seconds,
                file_size_bytes = excluded.file_size_bytes,
                format = excluded.format,
                quality_kbps = excluded.quality_kbps
            "#,
        )
        .bind(id.as_hex())
        .bind(&metadata.session_name)
        .bind(created_at_ms)
        .bind(metadata.start_time.timestamp_millis())
        .bind(metadata.duration_seconds)
        .bind(metadata.file_size_bytes as i64)
        .bind(metadata.format.as_str())
        .bind(metadata.quality_kbps as i64)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record one finalized segment and refresh the session totals in a
    /// single transaction.
    pub async fn append_segment(
        pool: &SqlitePool,
        session_id: SessionId,
        segment: &SegmentRef,
        session_metadata: &SessionMetadata,
    ) -> Result<(), SqlxError> {
        let mut transaction = pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO segments (id, session_id, sequence_index, path, display_name, duration_seconds, file_size_bytes, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                duration_seconds = excluded.duration_seconds,
                file_size_bytes = excluded.file_size_bytes
            "#,
        )
        .bind(segment.id.as_hex())
        .bind(session_id.as_hex())
        .bind(segment.sequence_index as i64)
        .bind(&segment.path)
        .bind(&segment.display_name)
        .bind(segment.metadata.duration_seconds)
        .bind(segment.metadata.file_size_bytes as i64)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *transaction)
        .await?;

        let updated = sqlx::query(
            "UPDATE sessions SET duration_seconds = ?, file_size_bytes = ? WHERE id = ?",
        )
        .bind(session_metadata.duration_seconds)
        .bind(session_metadata.file_size_bytes as i64)
        .bind(session_id.as_hex())
        .execute(&mut *transaction)
        .await?;

        if updated.rows_affected() == 0 {
            transaction.rollback().await?;
            return Err(SqlxError::RowNotFound);
        }

        transaction.commit().await?;
        Ok(())
    }

    pub async fn get_session(
        pool: &SqlitePool,
        session_id: SessionId,
    ) -> Result<Option<Session>, SqlxError> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id.as_hex())
            .fetch_optional(pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Self::assemble(pool, row).await?))
    }

    /// All sessions, fully assembled. Unordered; callers sort.
    pub async fn get_all_sessions(pool: &SqlitePool) -> Result<Vec<Session>, SqlxError> {
        let rows: Vec<SessionRow> = sqlx::query_as("SELECT * FROM sessions")
            .fetch_all(pool)
            .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(Self::assemble(pool, row).await?);
        }
        Ok(sessions)
    }

    async fn assemble(pool: &SqlitePool, row: SessionRow) -> Result<Session, SqlxError> {
        let segment_rows: Vec<SegmentRow> = sqlx::query_as(
            "SELECT * FROM segments WHERE session_id = ? ORDER BY sequence_index ASC",
        )
        .bind(&row.id)
        .fetch_all(pool)
        .await?;

        let note_rows: Vec<NoteRow> = sqlx::query_as(
            "SELECT note, created_at FROM session_notes WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(&row.id)
        .fetch_all(pool)
        .await?;

        let tags: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM session_tags WHERE session_id = ? ORDER BY tag ASC")
                .bind(&row.id)
                .fetch_all(pool)
                .await?;

        let id = SessionId::parse(&row.id).ok_or_else(|| {
            SqlxError::Protocol(format!("malformed session id '{}'", row.id))
        })?;

        let segments = segment_rows
            .iter()
            .filter_map(|s| s.to_ref(&row))
            .collect();

        Ok(Session {
            id,
            created_at: millis_to_utc(row.created_at),
            metadata: row.metadata(),
            segments,
            notes: note_rows
                .into_iter()
                .map(|n| Note {
                    text: n.note,
                    created_at: millis_to_utc(n.created_at),
                })
                .collect(),
            tags: tags.into_iter().map(|(t,)| t).collect(),
        })
    }

    /// Delete the session record and every dependent row. Blob bytes are the
    /// blob store's concern; callers cascade there first.
    pub async fn delete_session(
        pool: &SqlitePool,
        session_id: SessionId,
    ) -> Result<bool, SqlxError> {
        let id = session_id.as_hex();
        let mut transaction = pool.begin().await?;

        sqlx::query("DELETE FROM session_notes WHERE session_id = ?")
            .bind(&id)
            .execute(&mut *transaction)
            .await?;
        sqlx::query("DELETE FROM session_tags WHERE session_id = ?")
            .bind(&id)
            .execute(&mut *transaction)
            .await?;
        sqlx::query("DELETE FROM segments WHERE session_id = ?")
            .bind(&id)
            .execute(&mut *transaction)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(&id)
            .execute(&mut *transaction)
            .await?;

        if result.rows_affected() == 0 {
            transaction.rollback().await?;
            return Ok(false);
        }

        transaction.commit().await?;
        info!("Deleted session {} and all associated rows", id);
        Ok(true)
    }

    /// Append a note. The session row is re-read inside the transaction so a
    /// concurrent delete cannot leave a dangling note.
    pub async fn add_note(
        pool: &SqlitePool,
        session_id: SessionId,
        note: &str,
    ) -> Result<bool, SqlxError> {
        let id = session_id.as_hex();
        let mut transaction = pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *transaction)
            .await?;
        if exists.is_none() {
            transaction.rollback().await?;
            return Ok(false);
        }

        sqlx::query("INSERT INTO session_notes (session_id, note, created_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(note)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;
        Ok(true)
    }

    /// Union `tags` into the session's tag set. The existing set is re-read
    /// inside the transaction; the 20-tag cap applies to the union.
    pub async fn add_tags(
        pool: &SqlitePool,
        session_id: SessionId,
        tags: &[String],
    ) -> Result<TagWriteOutcome, SqlxError> {
        let id = session_id.as_hex();
        let mut transaction = pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *transaction)
            .await?;
        if exists.is_none() {
            transaction.rollback().await?;
            return Ok(TagWriteOutcome::SessionMissing);
        }

        let existing: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM session_tags WHERE session_id = ?")
                .bind(&id)
                .fetch_all(&mut *transaction)
                .await?;
        let existing: std::collections::HashSet<String> =
            existing.into_iter().map(|(t,)| t).collect();

        let new_tags: Vec<&String> = tags.iter().filter(|t| !existing.contains(*t)).collect();
        if existing.len() + new_tags.len() > MAX_TAGS_PER_SESSION {
            transaction.rollback().await?;
            return Ok(TagWriteOutcome::TooManyTags);
        }

        for tag in new_tags {
            sqlx::query("INSERT OR IGNORE INTO session_tags (session_id, tag) VALUES (?, ?)")
                .bind(&id)
                .bind(tag)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;
        Ok(TagWriteOutcome::Applied)
    }

    /// Remove one tag. Absent tags are a silent no-op.
    pub async fn remove_tag(
        pool: &SqlitePool,
        session_id: SessionId,
        tag: &str,
    ) -> Result<(), SqlxError> {
        sqlx::query("DELETE FROM session_tags WHERE session_id = ? AND tag = ?")
            .bind(session_id.as_hex())
            .bind(tag)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Locate the session a recovered checkpoint belongs to, so recovery
    /// resumes the existing record instead of minting a duplicate.
    pub async fn find_by_start(
        pool: &SqlitePool,
        name: &str,
        start_time_ms: i64,
    ) -> Result<Option<SessionId>, SqlxError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE name = ? AND start_time = ? LIMIT 1")
                .bind(name)
                .bind(start_time_ms)
                .fetch_optional(pool)
                .await?;
        Ok(row.and_then(|(id,)| SessionId::parse(&id)))
    }

    /// Segment ids referenced by any session; used by the orphan sweep.
    pub async fn referenced_segment_ids(pool: &SqlitePool) -> Result<Vec<String>, SqlxError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM segments")
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn session_exists(
        pool: &SqlitePool,
        session_id: SessionId,
    ) -> Result<bool, SqlxError> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id.as_hex())
            .fetch_optional(pool)
            .await?;
        Ok(exists.is_some())
    }
}

/// Log-and-continue wrapper for best-effort session writes on failure paths.
pub async fn try_upsert_session(
    pool: &SqlitePool,
    id: SessionId,
    created_at_ms: i64,
    metadata: &SessionMetadata,
) {
    if let Err(e) = SessionsRepository::upsert_session(pool, id, created_at_ms, metadata).await {
        error!("Best-effort session write for {} failed: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::SegmentId;
    use crate::database::DatabaseManager;
    use crate::settings::AudioFormat;
    use tempfile::{tempdir, TempDir};

    async fn open_db() -> (TempDir, DatabaseManager) {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::open(&dir.path().join("t.sqlite")).await.unwrap();
        (dir, db)
    }

    fn meta(name: &str, duration: f64, size: u64) -> SessionMetadata {
        SessionMetadata {
            session_name: name.to_string(),
            start_time: Utc::now(),
            duration_seconds: duration,
            file_size_bytes: size,
            format: AudioFormat::Wav,
            quality_kbps: 320,
        }
    }

    fn segment(seq: u32, duration: f64, size: u64) -> SegmentRef {
        let id = SegmentId::generate();
        SegmentRef {
            id,
            path: format!("recordings/{id}"),
            display_name: format!("Test_2025-01-01_0000_part{seq:03}"),
            metadata: meta("Test", duration, size),
            sequence_index: seq,
        }
    }

    #[tokio::test]
    async fn upsert_get_roundtrip() {
        let (_dir, db) = open_db().await;
        let id = SessionId::generate();
        let created = Utc::now().timestamp_millis();

        SessionsRepository::upsert_session(db.pool(), id, created, &meta("Goblin Ambush", 3.0, 529200))
            .await
            .unwrap();

        let session = SessionsRepository::get_session(db.pool(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.metadata.session_name, "Goblin Ambush");
        assert_eq!(session.metadata.format, AudioFormat::Wav);
        assert!(session.segments.is_empty());

        // Second upsert updates in place.
        SessionsRepository::upsert_session(db.pool(), id, created, &meta("Goblin Ambush", 6.0, 1058400))
            .await
            .unwrap();
        let session = SessionsRepository::get_session(db.pool(), id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.metadata.duration_seconds, 6.0);
    }

    #[tokio::test]
    async fn segments_come_back_in_sequence_order() {
        let (_dir, db) = open_db().await;
        let id = SessionId::generate();
        SessionsRepository::upsert_session(db.pool(), id, 0, &meta("S", 0.0, 0))
            .await
            .unwrap();

        for seq in [2u32, 1, 3] {
            SessionsRepository::append_segment(
                db.pool(),
                id,
                &segment(seq, 60.0, 1000),
                &meta("S", 60.0 * seq as f64, 1000 * seq as u64),
            )
            .await
            .unwrap();
        }

        let session = SessionsRepository::get_session(db.pool(), id)
            .await
            .unwrap()
            .unwrap();
        let seqs: Vec<u32> = session.segments.iter().map(|s| s.sequence_index).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn append_segment_requires_session() {
        let (_dir, db) = open_db().await;
        let result = SessionsRepository::append_segment(
            db.pool(),
            SessionId::generate(),
            &segment(1, 1.0, 1),
            &meta("S", 1.0, 1),
        )
        .await;
        assert!(matches!(result, Err(SqlxError::RowNotFound)));
    }

    #[tokio::test]
    async fn delete_cascades_rows() {
        let (_dir, db) = open_db().await;
        let id = SessionId::generate();
        SessionsRepository::upsert_session(db.pool(), id, 0, &meta("S", 0.0, 0))
            .await
            .unwrap();
        SessionsRepository::append_segment(db.pool(), id, &segment(1, 1.0, 1), &meta("S", 1.0, 1))
            .await
            .unwrap();
        SessionsRepository::add_note(db.pool(), id, "note").await.unwrap();
        SessionsRepository::add_tags(db.pool(), id, &["tag".to_string()])
            .await
            .unwrap();

        assert!(SessionsRepository::delete_session(db.pool(), id).await.unwrap());
        assert!(SessionsRepository::get_session(db.pool(), id).await.unwrap().is_none());

        for table in ["segments", "session_notes", "session_tags"] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap();
            assert_eq!(count.0, 0, "{table}");
        }

        // Deleting again reports absence.
        assert!(!SessionsRepository::delete_session(db.pool(), id).await.unwrap());
    }

    #[tokio::test]
    async fn tag_union_respects_cap() {
        let (_dir, db) = open_db().await;
        let id = SessionId::generate();
        SessionsRepository::upsert_session(db.pool(), id, 0, &meta("S", 0.0, 0))
            .await
            .unwrap();

        let first: Vec<String> = (0..19).map(|i| format!("tag{i:02}")).collect();
        assert_eq!(
            SessionsRepository::add_tags(db.pool(), id, &first).await.unwrap(),
            TagWriteOutcome::Applied
        );

        // Re-adding an existing tag plus one new one fits exactly.
        let more = vec!["tag00".to_string(), "tag19".to_string()];
        assert_eq!(
            SessionsRepository::add_tags(db.pool(), id, &more).await.unwrap(),
            TagWriteOutcome::Applied
        );

        let over = vec!["tag20".to_string()];
        assert_eq!(
            SessionsRepository::add_tags(db.pool(), id, &over).await.unwrap(),
            TagWriteOutcome::TooManyTags
        );
    }

    #[tokio::test]
    async fn notes_preserve_insertion_order() {
        let (_dir, db) = open_db().await;
        let id = SessionId::generate();
        SessionsRepository::upsert_session(db.pool(), id, 0, &meta("S", 0.0, 0))
            .await
            .unwrap();

        for text in ["first", "second", "third"] {
            SessionsRepository::add_note(db.pool(), id, text).await.unwrap();
        }
        let session = SessionsRepository::get_session(db.pool(), id)
            .await
            .unwrap()
            .unwrap();
        let texts: Vec<&str> = session.notes.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn remove_absent_tag_is_noop() {
        let (_dir, db) = open_db().await;
        let id = SessionId::generate();
        SessionsRepository::upsert_session(db.pool(), id, 0, &meta("S", 0.0, 0))
            .await
            .unwrap();
        SessionsRepository::remove_tag(db.pool(), id, "ghost").await.unwrap();
    }
}
