//! Domain models and their persisted row shapes.
//!
//! Instants are stored as integer milliseconds since the Unix epoch and
//! converted at the edges; the recovery payload alone uses ISO-8601 strings
//! (it is a JSON document read back after a crash, where a human-readable
//! timestamp earns its keep).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::settings::AudioFormat;

/// 128-bit random session identifier; canonical form is lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

/// 128-bit random segment identifier; canonical form is lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_hex(&self) -> String {
                self.0.simple().to_string()
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }
    };
}

impl_id!(SessionId);
impl_id!(SegmentId);

pub(crate) fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Metadata snapshot for a session or a single segment. On a [`SegmentRef`]
/// the duration and size describe that segment alone; name, start, format
/// and quality are session-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_name: String,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
    pub format: AudioFormat,
    pub quality_kbps: u32,
}

impl SessionMetadata {
    /// Placeholder metadata returned when real metadata cannot be recovered
    /// (stuck encoder, forced stop with nothing live).
    pub fn synthetic(session_name: String, start_time: DateTime<Utc>) -> Self {
        Self {
            session_name,
            start_time,
            duration_seconds: 0.0,
            file_size_bytes: 0,
            format: AudioFormat::Unknown,
            quality_kbps: 0,
        }
    }
}

/// Reference from a session to one durable segment blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub id: SegmentId,
    /// Storage-relative blob path: `recordings/{segment_id}`. Never carries
    /// user content.
    pub path: String,
    /// Human-facing name: `{session}_{date}_{time}_partNNN`.
    pub display_name: String,
    pub metadata: SessionMetadata,
    pub sequence_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// One recorded gathering, possibly split across several segment blobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub metadata: SessionMetadata,
    pub segments: Vec<SegmentRef>,
    pub notes: Vec<Note>,
    pub tags: Vec<String>,
}

/// Durable snapshot of the live recording, written on a 5 s cadence and on
/// the host crash signal. Single slot keyed `current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryCheckpoint {
    pub session_name: String,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub is_paused: bool,
    /// The in-progress segment at checkpoint time, if any chunk reached disk.
    pub current_segment_ref: Option<SegmentRef>,
    pub metadata: SessionMetadata,
}

/// Metadata record for one stored blob (`audio_blobs` collection, v2).
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRecord {
    pub id: SegmentId,
    pub path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

// Row shapes as they come out of sqlite.

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub created_at: i64,
    pub start_time: i64,
    pub duration_seconds: f64,
    pub file_size_bytes: i64,
    pub format: String,
    pub quality_kbps: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SegmentRow {
    pub id: String,
    pub session_id: String,
    pub sequence_index: i64,
    pub path: String,
    pub display_name: String,
    pub duration_seconds: f64,
    pub file_size_bytes: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct NoteRow {
    pub note: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    pub id: String,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: i64,
}

impl SessionRow {
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            session_name: self.name.clone(),
            start_time: millis_to_utc(self.start_time),
            duration_seconds: self.duration_seconds,
            file_size_bytes: self.file_size_bytes.max(0) as u64,
            format: AudioFormat::parse(&self.format).unwrap_or(AudioFormat::Unknown),
            quality_kbps: self.quality_kbps.max(0) as u32,
        }
    }
}

impl SegmentRow {
    /// Rebuild the finalize-time snapshot from the segment row plus the
    /// session-wide fields of its parent.
    pub fn to_ref(&self, session: &SessionRow) -> Option<SegmentRef> {
        let id = SegmentId::parse(&self.id)?;
        Some(SegmentRef {
            id,
            path: self.path.clone(),
            display_name: self.display_name.clone(),
            metadata: SessionMetadata {
                session_name: session.name.clone(),
                start_time: millis_to_utc(session.start_time),
                duration_seconds: self.duration_seconds,
                file_size_bytes: self.file_size_bytes.max(0) as u64,
                format: AudioFormat::parse(&session.format).unwrap_or(AudioFormat::Unknown),
                quality_kbps: session.quality_kbps.max(0) as u32,
            },
            sequence_index: self.sequence_index.max(0) as u32,
        })
    }
}

impl BlobRow {
    pub fn to_record(&self) -> Option<BlobRecord> {
        Some(BlobRecord {
            id: SegmentId::parse(&self.id)?,
            path: self.path.clone(),
            size_bytes: self.size_bytes.max(0) as u64,
            created_at: millis_to_utc(self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_hex_formatted() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);

        let hex = a.as_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(SessionId::parse(&hex), Some(a));
    }

    #[test]
    fn checkpoint_serializes_timestamps_as_iso8601() {
        let checkpoint = RecoveryCheckpoint {
            session_name: "Campaign 5".into(),
            start_time: DateTime::parse_from_rfc3339("2025-03-07T21:05:00Z")
                .unwrap()
                .with_timezone(&Utc),
            duration_seconds: 30.0,
            is_paused: false,
            current_segment_ref: None,
            metadata: SessionMetadata::synthetic("Campaign 5".into(), Utc::now()),
        };
        let json = serde_json::to_string(&checkpoint).unwrap();
        assert!(json.contains("2025-03-07T21:05:00Z"));

        let back: RecoveryCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.start_time, checkpoint.start_time);
    }

    #[test]
    fn synthetic_metadata_is_marked_unknown() {
        let meta = SessionMetadata::synthetic("x".into(), Utc::now());
        assert_eq!(meta.format, AudioFormat::Unknown);
        assert_eq!(meta.file_size_bytes, 0);
        assert_eq!(meta.quality_kbps, 0);
    }

    #[test]
    fn segment_row_round_trip() {
        let session = SessionRow {
            id: SessionId::generate().as_hex(),
            name: "Goblin Ambush".into(),
            created_at: 1_700_000_000_000,
            start_time: 1_700_000_000_000,
            duration_seconds: 120.0,
            file_size_bytes: 2048,
            format: "wav".into(),
            quality_kbps: 320,
        };
        let seg_id = SegmentId::generate();
        let row = SegmentRow {
            id: seg_id.as_hex(),
            session_id: session.id.clone(),
            sequence_index: 2,
            path: format!("recordings/{seg_id}"),
            display_name: "Goblin Ambush_2023-11-14_2213_part002".into(),
            duration_seconds: 60.0,
            file_size_bytes: 1024,
            created_at: 1_700_000_060_000,
        };
        let re = row.to_ref(&session).unwrap();
        assert_eq!(re.id, seg_id);
        assert_eq!(re.sequence_index, 2);
        assert_eq!(re.metadata.duration_seconds, 60.0);
        assert_eq!(re.metadata.file_size_bytes, 1024);
        assert_eq!(re.metadata.session_name, "Goblin Ambush");
    }
}
