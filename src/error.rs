//! Error taxonomy for the recording core.
//!
//! Every terminal error renders as a single human-readable sentence; hosts
//! match on the variant to decide recovery UI.

use thiserror::Error;

use crate::database::models::SessionMetadata;

/// Input validation failures. Surfaced to the caller without side effects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("session name must be 1 to 100 characters of letters, digits, spaces, '_', '-' or '.'")]
    SessionNameInvalid,
    #[error("note exceeds the 1000 character limit")]
    NoteTooLong,
    #[error("tag '{0}' must be 1 to 50 characters of letters, digits, '_' or '-'")]
    TagInvalid(String),
    #[error("a session may carry at most {max} tags", max = crate::validation::MAX_TAGS_PER_SESSION)]
    TooManyTags,
    #[error("tag '{0}' appears more than once in the request")]
    DuplicateTag(String),
}

/// Device and permission failures.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("microphone permission was denied")]
    PermissionDenied,
    #[error("no audio input device is available")]
    NoInputDevice,
    #[error("the input device cannot satisfy 44.1 kHz stereo capture")]
    ConstraintsUnsatisfiable,
    #[error("the input device was lost: {0}")]
    DeviceLost(String),
}

/// Engine state machine violations. Never mutate state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("a recording session is already in progress")]
    AlreadyRecording,
    #[error("no recording session is in progress")]
    NotRecording,
    #[error("operation '{event}' is not legal in state {from:?}")]
    IllegalTransition {
        from: crate::audio::recording_state::EngineState,
        event: &'static str,
    },
}

/// Persistence failures across the blob, session and recovery stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write segment bytes: {0}")]
    BlobWriteFailed(String),
    #[error("segment blob not found")]
    BlobNotFound,
    #[error("session store operation failed: {0}")]
    SessionStoreFailed(#[source] sqlx::Error),
    #[error("recovery store operation failed: {0}")]
    RecoveryStoreFailed(String),
}

/// Encoder pipeline failures.
#[derive(Debug, Clone, Error)]
pub enum EncoderError {
    #[error("the audio device dropped mid-stream")]
    DeviceDropped,
    #[error("the encoder rejected the capture constraints: {0}")]
    ConstraintFailed(String),
    #[error("encoder failure: {0}")]
    Internal(String),
}

/// Failures of [`crate::audio::RecordingEngine::start`] and
/// [`crate::audio::RecordingEngine::recover`].
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("an interrupted session can be recovered; recover or discard it first")]
    RecoveryAvailable,
    #[error("no recoverable session checkpoint exists")]
    RecoveryUnavailable,
}

/// Failures of [`crate::audio::RecordingEngine::stop`]. The timeout and
/// encoder variants still carry best-effort metadata so the host can settle
/// its UI.
#[derive(Debug, Error)]
pub enum StopError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("the encoder did not acknowledge stop within {timeout_secs} s")]
    StopTimeout {
        timeout_secs: u64,
        metadata: SessionMetadata,
    },
    #[error("the encoder failed while finalizing: {reason}")]
    EncoderFailed {
        reason: String,
        metadata: SessionMetadata,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures of read-side catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("session not found")]
    SessionNotFound,
    #[error("export cannot convert between audio formats")]
    FormatConversionUnsupported,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::SessionStoreFailed(err)
    }
}
