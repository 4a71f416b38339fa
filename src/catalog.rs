//! Read-side operations over persisted sessions: listing, search,
//! annotation, export and deletion.

use log::info;

use crate::database::models::{Session, SessionId};
use crate::database::repositories::{BlobStore, SessionsRepository};
use crate::database::repositories::session::TagWriteOutcome;
use crate::database::DatabaseManager;
use crate::error::{CatalogError, StorageError, ValidationError};
use crate::settings::AudioFormat;
use crate::validation;

#[derive(Clone)]
pub struct Catalog {
    db: DatabaseManager,
    blobs: BlobStore,
}

impl Catalog {
    pub fn new(db: DatabaseManager, blobs: BlobStore) -> Self {
        Self { db, blobs }
    }

    /// All sessions, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, CatalogError> {
        let mut sessions = SessionsRepository::get_all_sessions(self.db.pool())
            .await
            .map_err(StorageError::SessionStoreFailed)?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// Case-insensitive substring search. The query splits on ASCII
    /// whitespace and every token must match the name, a note or a tag.
    /// An empty query lists everything. Debouncing is the caller's concern.
    pub async fn search(&self, query: &str) -> Result<Vec<Session>, CatalogError> {
        let tokens: Vec<String> = query
            .split_ascii_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let sessions = self.list_sessions().await?;
        if tokens.is_empty() {
            return Ok(sessions);
        }

        Ok(sessions
            .into_iter()
            .filter(|session| tokens.iter().all(|token| session_matches(session, token)))
            .collect())
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Session, CatalogError> {
        SessionsRepository::get_session(self.db.pool(), id)
            .await
            .map_err(StorageError::SessionStoreFailed)?
            .ok_or(CatalogError::SessionNotFound)
    }

    pub async fn add_note(&self, id: SessionId, note: &str) -> Result<(), CatalogError> {
        validation::validate_note(note)?;
        let added = SessionsRepository::add_note(self.db.pool(), id, note)
            .await
            .map_err(StorageError::SessionStoreFailed)?;
        if !added {
            return Err(CatalogError::SessionNotFound);
        }
        Ok(())
    }

    pub async fn add_tags(&self, id: SessionId, tags: &[String]) -> Result<(), CatalogError> {
        validation::validate_tags(tags, 0)?;
        match SessionsRepository::add_tags(self.db.pool(), id, tags)
            .await
            .map_err(StorageError::SessionStoreFailed)?
        {
            TagWriteOutcome::Applied => Ok(()),
            TagWriteOutcome::SessionMissing => Err(CatalogError::SessionNotFound),
            TagWriteOutcome::TooManyTags => Err(ValidationError::TooManyTags.into()),
        }
    }

    /// No-op if the tag is absent.
    pub async fn remove_tag(&self, id: SessionId, tag: &str) -> Result<(), CatalogError> {
        SessionsRepository::remove_tag(self.db.pool(), id, tag)
            .await
            .map_err(StorageError::SessionStoreFailed)?;
        Ok(())
    }

    /// Concatenate the session's segment blobs in sequence order. Bytes pass
    /// through unchanged; asking for a different container is refused.
    pub async fn export(
        &self,
        id: SessionId,
        target_format: Option<AudioFormat>,
    ) -> Result<Vec<u8>, CatalogError> {
        let session = self.get_session(id).await?;

        if let Some(target) = target_format {
            if target != session.metadata.format {
                return Err(CatalogError::FormatConversionUnsupported);
            }
        }

        let mut bytes = Vec::with_capacity(session.metadata.file_size_bytes as usize);
        for segment in &session.segments {
            let blob = self.blobs.load(segment.id).await?;
            bytes.extend_from_slice(&blob);
        }
        Ok(bytes)
    }

    /// Suggested export filename: `{session_name}.{ext}`.
    pub fn export_filename(session: &Session) -> String {
        format!(
            "{}.{}",
            session.metadata.session_name,
            session.metadata.format.extension()
        )
    }

    /// Remove the session record and every segment blob it owns.
    pub async fn delete_session(&self, id: SessionId) -> Result<(), CatalogError> {
        let session = self.get_session(id).await?;

        for segment in &session.segments {
            self.blobs.delete(segment.id).await?;
        }

        let deleted = SessionsRepository::delete_session(self.db.pool(), id)
            .await
            .map_err(StorageError::SessionStoreFailed)?;
        if !deleted {
            return Err(CatalogError::SessionNotFound);
        }
        info!("Deleted session '{}'", session.metadata.session_name);
        Ok(())
    }
}

fn session_matches(session: &Session, token: &str) -> bool {
    if session.metadata.session_name.to_lowercase().contains(token) {
        return true;
    }
    if session
        .notes
        .iter()
        .any(|note| note.text.to_lowercase().contains(token))
    {
        return true;
    }
    session
        .tags
        .iter()
        .any(|tag| tag.to_lowercase().contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{SegmentId, SegmentRef, SessionMetadata};
    use crate::ports::StdFilePort;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        catalog: Catalog,
        db: DatabaseManager,
        blobs: BlobStore,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::open(&dir.path().join("t.sqlite")).await.unwrap();
        let blobs = BlobStore::new(
            db.pool().clone(),
            Arc::new(StdFilePort),
            dir.path().to_path_buf(),
        );
        blobs.ensure_layout().unwrap();
        let catalog = Catalog::new(db.clone(), blobs.clone());
        Fixture {
            _dir: dir,
            catalog,
            db,
            blobs,
        }
    }

    fn metadata(name: &str) -> SessionMetadata {
        SessionMetadata {
            session_name: name.to_string(),
            start_time: Utc::now(),
            duration_seconds: 10.0,
            file_size_bytes: 0,
            format: AudioFormat::Wav,
            quality_kbps: 320,
        }
    }

    async fn seed_session(f: &Fixture, name: &str, created_at_ms: i64) -> SessionId {
        let id = SessionId::generate();
        SessionsRepository::upsert_session(f.db.pool(), id, created_at_ms, &metadata(name))
            .await
            .unwrap();
        id
    }

    async fn seed_segment(f: &Fixture, session: SessionId, seq: u32, bytes: &[u8]) -> SegmentId {
        let seg_id = SegmentId::generate();
        f.blobs.save(seg_id, bytes).await.unwrap();
        let segment = SegmentRef {
            id: seg_id,
            path: BlobStore::relative_path(seg_id),
            display_name: format!("seg{seq:03}"),
            metadata: metadata("x"),
            sequence_index: seq,
        };
        SessionsRepository::append_segment(f.db.pool(), session, &segment, &metadata("x"))
            .await
            .unwrap();
        seg_id
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let f = fixture().await;
        seed_session(&f, "Oldest", 1_000).await;
        seed_session(&f, "Newest", 3_000).await;
        seed_session(&f, "Middle", 2_000).await;

        let names: Vec<String> = f
            .catalog
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.metadata.session_name)
            .collect();
        assert_eq!(names, vec!["Newest", "Middle", "Oldest"]);
    }

    #[tokio::test]
    async fn search_requires_every_token() {
        let f = fixture().await;
        let goblin = seed_session(&f, "Goblin Ambush", 1).await;
        let dragon = seed_session(&f, "Dragon Heist", 2).await;
        f.catalog.add_note(goblin, "the party fled").await.unwrap();
        f.catalog
            .add_tags(dragon, &["oneshot".to_string()])
            .await
            .unwrap();

        // Single token, case-insensitive, substring.
        let hits = f.catalog.search("goblin").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.session_name, "Goblin Ambush");

        // AND semantics across fields: name + note.
        assert_eq!(f.catalog.search("goblin fled").await.unwrap().len(), 1);
        assert_eq!(f.catalog.search("goblin oneshot").await.unwrap().len(), 0);

        // Tag match.
        assert_eq!(f.catalog.search("ONESHOT").await.unwrap().len(), 1);

        // Empty query behaves as list.
        assert_eq!(f.catalog.search("   ").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn note_and_tag_validation() {
        let f = fixture().await;
        let id = seed_session(&f, "S", 1).await;

        assert!(matches!(
            f.catalog.add_note(id, &"x".repeat(1001)).await,
            Err(CatalogError::Validation(ValidationError::NoteTooLong))
        ));
        assert!(matches!(
            f.catalog.add_tags(id, &["bad tag".to_string()]).await,
            Err(CatalogError::Validation(ValidationError::TagInvalid(_)))
        ));
        assert!(matches!(
            f.catalog
                .add_tags(id, &["dup".to_string(), "dup".to_string()])
                .await,
            Err(CatalogError::Validation(ValidationError::DuplicateTag(_)))
        ));

        f.catalog.add_tags(id, &["good".to_string()]).await.unwrap();
        // Re-adding unions silently.
        f.catalog.add_tags(id, &["good".to_string()]).await.unwrap();
        let session = f.catalog.get_session(id).await.unwrap();
        assert_eq!(session.tags, vec!["good"]);

        f.catalog.remove_tag(id, "good").await.unwrap();
        f.catalog.remove_tag(id, "ghost").await.unwrap();
        assert!(f.catalog.get_session(id).await.unwrap().tags.is_empty());
    }

    #[tokio::test]
    async fn export_concatenates_in_sequence_order() {
        let f = fixture().await;
        let id = seed_session(&f, "Exported", 1).await;
        seed_segment(&f, id, 2, b"-middle").await;
        seed_segment(&f, id, 1, b"start").await;
        seed_segment(&f, id, 3, b"-end").await;

        let bytes = f.catalog.export(id, None).await.unwrap();
        assert_eq!(bytes, b"start-middle-end");

        // Same-format export is allowed, conversion is not.
        assert!(f.catalog.export(id, Some(AudioFormat::Wav)).await.is_ok());
        assert!(matches!(
            f.catalog.export(id, Some(AudioFormat::Compressed)).await,
            Err(CatalogError::FormatConversionUnsupported)
        ));
    }

    #[tokio::test]
    async fn export_filename_uses_format_extension() {
        let f = fixture().await;
        let id = seed_session(&f, "Goblin Ambush", 1).await;
        let session = f.catalog.get_session(id).await.unwrap();
        assert_eq!(Catalog::export_filename(&session), "Goblin Ambush.wav");
    }

    #[tokio::test]
    async fn delete_cascades_to_blobs() {
        let f = fixture().await;
        let id = seed_session(&f, "Doomed", 1).await;
        let seg = seed_segment(&f, id, 1, b"bytes").await;

        f.catalog.delete_session(id).await.unwrap();

        assert!(matches!(
            f.catalog.get_session(id).await,
            Err(CatalogError::SessionNotFound)
        ));
        assert!(f.blobs.load(seg).await.is_err());

        assert!(matches!(
            f.catalog.delete_session(id).await,
            Err(CatalogError::SessionNotFound)
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.catalog.get_session(SessionId::generate()).await,
            Err(CatalogError::SessionNotFound)
        ));
        assert!(matches!(
            f.catalog.add_note(SessionId::generate(), "n").await,
            Err(CatalogError::SessionNotFound)
        ));
    }
}
