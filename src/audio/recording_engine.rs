//! The recording engine.
//!
//! A single task owns every state transition. Control operations, capture
//! events, timer ticks and the host crash signal all funnel through it, so
//! nothing mutates engine state across threads. Control calls resolve
//! oneshot waiters; the capture task feeds chunks through an ordered channel.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::capture::{spawn_capture, CaptureCommand, CaptureEvent, CaptureHandle};
use super::devices::{DeviceConfig, DevicePort, DeviceStream};
use super::encode::EncoderFactory;
use super::level_meter::{LevelMeter, LevelUpdate, SilenceDetector, LEVEL_SAMPLE_INTERVAL};
use super::recording_state::{EngineState, SessionTimer, StateCell};
use crate::clock::Clock;
use crate::database::models::{
    RecoveryCheckpoint, SegmentId, SegmentRef, SessionId, SessionMetadata,
};
use crate::database::repositories::{with_retries, BlobStore, RecoveryStore, SessionsRepository};
use crate::database::DatabaseManager;
use crate::error::{EncoderError, StartError, StateError, StopError, StorageError};
use crate::ports::RecordingStatusPort;
use crate::settings::RecordingOptions;
use crate::validation;

/// Hard bound on encoder stop acknowledgment.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Checkpoint cadence while a session is live.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// Chunks delivered but not yet durable before a split is forced.
pub const MAX_PENDING_CHUNKS: usize = 100;

/// Checkpoints older than this are purged instead of offered for recovery.
pub const RECOVERY_WINDOW_HOURS: i64 = 24;

pub type LevelCallback = Box<dyn Fn(LevelUpdate) + Send + Sync>;
pub type AlertCallback = Box<dyn Fn(&EngineAlert) + Send + Sync>;

/// Advisory signals surfaced outside the control-call results.
#[derive(Debug)]
pub enum EngineAlert {
    /// Loudness stayed below the dynamic threshold for five seconds.
    SilenceDetected,
    DeviceLost(String),
    EncoderFailed(String),
    PersistenceFailed(String),
}

/// Everything the engine needs, wired by the composition root.
pub struct EngineParams {
    pub clock: Arc<dyn Clock>,
    pub devices: Arc<dyn DevicePort>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub db: DatabaseManager,
    pub blobs: BlobStore,
    pub recovery: RecoveryStore,
    pub status: Arc<dyn RecordingStatusPort>,
    pub crash: broadcast::Receiver<()>,
}

struct EngineShared {
    state: StateCell,
    meter: Arc<LevelMeter>,
    duration_secs: AtomicU64,
    level_callback: Mutex<Option<LevelCallback>>,
    alert_callback: Mutex<Option<AlertCallback>>,
}

impl EngineShared {
    fn alert(&self, alert: EngineAlert) {
        if let Some(callback) = self.alert_callback.lock().unwrap().as_ref() {
            callback(&alert);
        }
    }
}

enum EngineCommand {
    Start {
        name: String,
        options: RecordingOptions,
        reply: oneshot::Sender<Result<(), StartError>>,
    },
    Recover {
        options: RecordingOptions,
        reply: oneshot::Sender<Result<(), StartError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<(), StateError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), StateError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SessionMetadata, StopError>>,
    },
    ForceStop {
        reply: oneshot::Sender<SessionMetadata>,
    },
    Cleanup {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to the engine task. Cheap operations read shared atomics; control
/// operations round-trip through the task.
pub struct RecordingEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
    shared: Arc<EngineShared>,
    recovery: RecoveryStore,
    join: Option<JoinHandle<()>>,
}

impl RecordingEngine {
    pub fn spawn(params: EngineParams) -> Self {
        let shared = Arc::new(EngineShared {
            state: StateCell::new(EngineState::Idle),
            meter: Arc::new(LevelMeter::new()),
            duration_secs: AtomicU64::new(0),
            level_callback: Mutex::new(None),
            alert_callback: Mutex::new(None),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let recovery = params.recovery.clone();
        let task = EngineTask {
            shared: shared.clone(),
            commands: cmd_rx,
            clock: params.clock,
            devices: params.devices,
            encoders: params.encoders,
            db: params.db,
            blobs: params.blobs,
            recovery: params.recovery,
            status: params.status,
            crash_rx: params.crash,
            crash_closed: false,
            live: None,
        };
        let join = tokio::spawn(task.run());

        Self {
            commands: cmd_tx,
            shared,
            recovery,
            join: Some(join),
        }
    }

    pub async fn start(&self, name: &str) -> Result<(), StartError> {
        self.start_with_options(name, RecordingOptions::default()).await
    }

    pub async fn start_with_options(
        &self,
        name: &str,
        options: RecordingOptions,
    ) -> Result<(), StartError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Start {
            name: name.to_string(),
            options,
            reply: tx,
        });
        rx.await.expect("engine task alive")
    }

    /// Adopt the persisted checkpoint and re-enter `Recording`.
    pub async fn recover(&self, options: RecordingOptions) -> Result<(), StartError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Recover { options, reply: tx });
        rx.await.expect("engine task alive")
    }

    pub async fn pause(&self) -> Result<(), StateError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Pause { reply: tx });
        rx.await.expect("engine task alive")
    }

    pub async fn resume(&self) -> Result<(), StateError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Resume { reply: tx });
        rx.await.expect("engine task alive")
    }

    pub async fn stop(&self) -> Result<SessionMetadata, StopError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Stop { reply: tx });
        rx.await.expect("engine task alive")
    }

    /// Best-effort teardown for stuck states. Always lands in `Idle`.
    pub async fn force_stop(&self) -> SessionMetadata {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::ForceStop { reply: tx });
        rx.await.expect("engine task alive")
    }

    /// `Failed` → `Idle`.
    pub async fn cleanup(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Cleanup { reply: tx });
        rx.await.expect("engine task alive")
    }

    pub async fn get_recovery_state(&self) -> Result<Option<RecoveryCheckpoint>, StorageError> {
        self.recovery.get().await
    }

    pub async fn clear_recovery_state(&self) -> Result<(), StorageError> {
        self.recovery.clear().await
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.load()
    }

    /// Live active duration, refreshed once per second while recording.
    pub fn live_duration_secs(&self) -> u64 {
        self.shared.duration_secs.load(Ordering::SeqCst)
    }

    /// Register a loudness sink; fires at display rate while `Recording`.
    pub fn set_level_callback<F>(&self, callback: F)
    where
        F: Fn(LevelUpdate) + Send + Sync + 'static,
    {
        *self.shared.level_callback.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn set_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&EngineAlert) + Send + Sync + 'static,
    {
        *self.shared.alert_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Stop the engine task. Any live session is torn down without touching
    /// the checkpoint, as if the process had died.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    fn send(&self, command: EngineCommand) {
        self.commands.send(command).expect("engine task alive");
    }
}

struct SegmentProgress {
    id: Option<SegmentId>,
    bytes: u64,
    active_start_secs: f64,
    started_wall: DateTime<Utc>,
}

struct LiveSession {
    name: String,
    options: RecordingOptions,
    start_wall: DateTime<Utc>,
    created_at_ms: i64,
    timer: SessionTimer,
    session_id: Option<SessionId>,
    segment: SegmentProgress,
    next_sequence: u32,
    epoch: u64,
    last_split_mono: Duration,
    total_bytes: u64,
    pending_chunks: Arc<AtomicUsize>,
    events: mpsc::UnboundedReceiver<CaptureEvent>,
    capture: CaptureHandle,
    stream: Option<Box<dyn DeviceStream>>,
    level_token: CancellationToken,
}

enum EventOutcome {
    Continue,
    Failed(EngineAlert),
}

enum Tick {
    Command(Option<EngineCommand>),
    Event(Option<CaptureEvent>),
    Checkpoint,
    Duration,
    Crash,
}

struct EngineTask {
    shared: Arc<EngineShared>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    clock: Arc<dyn Clock>,
    devices: Arc<dyn DevicePort>,
    encoders: Arc<dyn EncoderFactory>,
    db: DatabaseManager,
    blobs: BlobStore,
    recovery: RecoveryStore,
    status: Arc<dyn RecordingStatusPort>,
    crash_rx: broadcast::Receiver<()>,
    crash_closed: bool,
    live: Option<LiveSession>,
}

impl EngineTask {
    async fn run(mut self) {
        let mut checkpoint_tick = tokio::time::interval(CHECKPOINT_INTERVAL);
        checkpoint_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut duration_tick = tokio::time::interval(Duration::from_secs(1));
        duration_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let tick = tokio::select! {
                cmd = self.commands.recv() => Tick::Command(cmd),
                event = Self::next_event(&mut self.live) => Tick::Event(event),
                _ = checkpoint_tick.tick() => Tick::Checkpoint,
                _ = duration_tick.tick() => Tick::Duration,
                crash = Self::next_crash(&mut self.crash_rx, self.crash_closed) => {
                    if crash { Tick::Crash } else { self.crash_closed = true; continue; }
                }
            };

            match tick {
                Tick::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Tick::Command(None) => break,
                Tick::Event(Some(event)) => self.on_capture_event(event).await,
                Tick::Event(None) => {
                    // Capture task ended without a stop handshake.
                    if self.live.is_some() {
                        self.on_capture_event(CaptureEvent::DeviceLost(
                            "capture pipeline ended".to_string(),
                        ))
                        .await;
                    }
                }
                Tick::Checkpoint => self.write_checkpoint().await,
                Tick::Duration => self.refresh_duration(),
                Tick::Crash => {
                    // One synchronous checkpoint before the host dies.
                    info!("Crash signal received, flushing checkpoint");
                    self.write_checkpoint().await;
                }
            }
        }

        // Task ending with a live session behaves like a crash: resources
        // are released, the checkpoint stays for recovery.
        if let Some(live) = self.live.take() {
            warn!("Engine task ending with a live session; leaving checkpoint behind");
            Self::release_resources(live);
            self.status.recording_changed(false);
        }
    }

    async fn next_event(live: &mut Option<LiveSession>) -> Option<CaptureEvent> {
        match live {
            Some(session) => session.events.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn next_crash(rx: &mut broadcast::Receiver<()>, closed: bool) -> bool {
        if closed {
            std::future::pending::<()>().await;
        }
        loop {
            match rx.recv().await {
                Ok(()) => return true,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    }

    fn state(&self) -> EngineState {
        self.shared.state.load()
    }

    fn set_state(&self, state: EngineState) {
        debug!("Engine state -> {:?}", state);
        self.shared.state.store(state);
    }

    fn refresh_duration(&self) {
        if let Some(live) = &self.live {
            let secs = live.timer.active(self.clock.monotonic()).as_secs();
            self.shared.duration_secs.store(secs, Ordering::SeqCst);
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Start { name, options, reply } => {
                let result = self.handle_start(name, options).await;
                let _ = reply.send(result);
            }
            EngineCommand::Recover { options, reply } => {
                let result = self.handle_recover(options).await;
                let _ = reply.send(result);
            }
            EngineCommand::Pause { reply } => {
                let _ = reply.send(self.handle_pause());
            }
            EngineCommand::Resume { reply } => {
                let _ = reply.send(self.handle_resume());
            }
            EngineCommand::Stop { reply } => {
                let result = self.handle_stop().await;
                let _ = reply.send(result);
            }
            EngineCommand::ForceStop { reply } => {
                let metadata = self.handle_force_stop().await;
                let _ = reply.send(metadata);
            }
            EngineCommand::Cleanup { reply } => {
                if self.state() == EngineState::Failed {
                    self.set_state(EngineState::Idle);
                }
                let _ = reply.send(());
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    async fn handle_start(
        &mut self,
        raw_name: String,
        options: RecordingOptions,
    ) -> Result<(), StartError> {
        if self.state() != EngineState::Idle {
            return Err(StateError::AlreadyRecording.into());
        }

        if self.recovery.get().await?.is_some() {
            return Err(StartError::RecoveryAvailable);
        }

        let sanitized = validation::sanitize_session_name(&raw_name);
        let name = if sanitized.is_empty() {
            validation::default_session_name(self.clock.now_utc())
        } else {
            sanitized
        };
        validation::validate_session_name(&name)?;

        self.set_state(EngineState::Starting);
        let start_wall = self.clock.now_utc();
        let timer = SessionTimer::start(self.clock.monotonic());

        match self.open_session(name, options, timer, start_wall, 1).await {
            Ok(live) => {
                self.live = Some(live);
                self.set_state(EngineState::Recording);
                self.status.recording_changed(true);
                self.write_checkpoint().await;
                info!("Recording started");
                Ok(())
            }
            Err(e) => {
                // All partial resources were released by open_session.
                self.set_state(EngineState::Idle);
                Err(e)
            }
        }
    }

    async fn handle_recover(&mut self, options: RecordingOptions) -> Result<(), StartError> {
        if self.state() != EngineState::Idle {
            return Err(StateError::AlreadyRecording.into());
        }

        let Some(checkpoint) = self.recovery.get().await? else {
            return Err(StartError::RecoveryUnavailable);
        };
        let age = self.clock.now_utc() - checkpoint.start_time;
        if age > chrono::Duration::hours(RECOVERY_WINDOW_HOURS) {
            warn!("Recovery checkpoint is older than {}h; purging", RECOVERY_WINDOW_HOURS);
            self.recovery.clear().await?;
            return Err(StartError::RecoveryUnavailable);
        }

        let mut options = options;
        if checkpoint.metadata.quality_kbps > 0 {
            options.quality_kbps = checkpoint.metadata.quality_kbps;
        }
        if checkpoint.metadata.format != crate::settings::AudioFormat::Unknown {
            options.format = checkpoint.metadata.format;
        }

        self.set_state(EngineState::Starting);
        let timer = SessionTimer::with_offset(
            Duration::from_secs_f64(checkpoint.duration_seconds.max(0.0)),
            self.clock.monotonic(),
        );

        let next_sequence = checkpoint
            .current_segment_ref
            .as_ref()
            .map(|seg| seg.sequence_index + 1)
            .unwrap_or(1);

        let mut live = match self
            .open_session(
                checkpoint.session_name.clone(),
                options,
                timer,
                checkpoint.start_time,
                next_sequence,
            )
            .await
        {
            Ok(live) => live,
            Err(e) => {
                self.set_state(EngineState::Idle);
                return Err(e);
            }
        };

        // Resume the session record the crashed run already created rather
        // than minting a duplicate.
        match SessionsRepository::find_by_start(
            self.db.pool(),
            &checkpoint.session_name,
            checkpoint.start_time.timestamp_millis(),
        )
        .await
        {
            Ok(existing) => live.session_id = existing,
            Err(e) => warn!("Could not look up the crashed session record: {}", e),
        }

        // The segment that was in flight when the process died is already
        // durable on disk; adopt it instead of orphaning those bytes.
        if let Some(partial) = &checkpoint.current_segment_ref {
            match self.promote_partial_segment(&mut live, partial, &checkpoint).await {
                Ok(true) => info!(
                    "Adopted partial segment {} from checkpoint",
                    partial.id
                ),
                Ok(false) => debug!("Checkpoint segment had no bytes on disk"),
                Err(e) => warn!("Could not adopt checkpoint segment: {}", e),
            }
        }

        self.live = Some(live);
        self.set_state(EngineState::Recording);
        self.status.recording_changed(true);
        self.write_checkpoint().await;
        info!("Recovered session '{}'", checkpoint.session_name);
        Ok(())
    }

    async fn open_session(
        &mut self,
        name: String,
        options: RecordingOptions,
        timer: SessionTimer,
        start_wall: DateTime<Utc>,
        next_sequence: u32,
    ) -> Result<LiveSession, StartError> {
        if let Err(reason) = options.validate() {
            return Err(EncoderError::ConstraintFailed(reason).into());
        }

        let config = DeviceConfig {
            device_id: options.input_device_id.clone(),
            ..DeviceConfig::default()
        };
        let opened = self.devices.open(&config)?;

        let encoder = match self.encoders.create(options.format, options.quality_kbps) {
            Ok(encoder) => encoder,
            Err(e) => {
                opened.stream.close();
                return Err(e.into());
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending_chunks = Arc::new(AtomicUsize::new(0));
        let capture = spawn_capture(
            opened.events,
            encoder,
            self.shared.meter.clone(),
            event_tx,
            pending_chunks.clone(),
        );

        let level_token = CancellationToken::new();
        spawn_level_task(self.shared.clone(), self.clock.clone(), level_token.clone());

        let now_mono = self.clock.monotonic();
        let active_now = timer.active_secs(now_mono);
        Ok(LiveSession {
            name,
            options,
            start_wall,
            created_at_ms: self.clock.now_utc().timestamp_millis(),
            timer,
            session_id: None,
            segment: SegmentProgress {
                id: None,
                bytes: 0,
                active_start_secs: active_now,
                started_wall: self.clock.now_utc(),
            },
            next_sequence,
            epoch: 0,
            last_split_mono: now_mono,
            total_bytes: 0,
            pending_chunks,
            events: event_rx,
            capture,
            stream: Some(opened.stream),
            level_token,
        })
    }

    /// Register the checkpoint's in-progress segment as a durable segment of
    /// the recovered session. The bytes were appended before the crash.
    async fn promote_partial_segment(
        &self,
        live: &mut LiveSession,
        partial: &SegmentRef,
        checkpoint: &RecoveryCheckpoint,
    ) -> Result<bool, StorageError> {
        let Some(size) = self.blobs.file_size(partial.id) else {
            return Ok(false);
        };
        if size == 0 {
            return Ok(false);
        }

        let session_id = live.session_id.unwrap_or_else(SessionId::generate);
        live.session_id = Some(session_id);
        live.total_bytes = size;

        let mut session_metadata = checkpoint.metadata.clone();
        session_metadata.session_name = live.name.clone();
        session_metadata.file_size_bytes = size;

        SessionsRepository::upsert_session(
            self.db.pool(),
            session_id,
            live.created_at_ms,
            &session_metadata,
        )
        .await?;

        self.blobs.adopt_existing(partial.id).await?;

        let mut segment = partial.clone();
        segment.metadata.file_size_bytes = size;
        SessionsRepository::append_segment(self.db.pool(), session_id, &segment, &session_metadata)
            .await?;
        Ok(true)
    }

    fn handle_pause(&mut self) -> Result<(), StateError> {
        match self.state() {
            EngineState::Recording => {}
            EngineState::Idle | EngineState::Failed => return Err(StateError::NotRecording),
            from => {
                return Err(StateError::IllegalTransition {
                    from,
                    event: "pause",
                })
            }
        }
        let now = self.clock.monotonic();
        if let Some(live) = self.live.as_mut() {
            live.timer.pause(now);
            let _ = live.capture.commands.send(CaptureCommand::SetPaused(true));
        }
        self.set_state(EngineState::Paused);
        info!("Recording paused");
        Ok(())
    }

    fn handle_resume(&mut self) -> Result<(), StateError> {
        match self.state() {
            EngineState::Paused => {}
            EngineState::Idle | EngineState::Failed => return Err(StateError::NotRecording),
            from => {
                return Err(StateError::IllegalTransition {
                    from,
                    event: "resume",
                })
            }
        }
        let now = self.clock.monotonic();
        if let Some(live) = self.live.as_mut() {
            live.timer.resume(now);
            let _ = live.capture.commands.send(CaptureCommand::SetPaused(false));
        }
        self.set_state(EngineState::Recording);
        info!("Recording resumed");
        Ok(())
    }

    async fn handle_stop(&mut self) -> Result<SessionMetadata, StopError> {
        match self.state() {
            EngineState::Recording | EngineState::Paused => {}
            _ => return Err(StateError::NotRecording.into()),
        }

        let Some(mut live) = self.live.take() else {
            return Err(StateError::NotRecording.into());
        };

        // Self-resume before finalizing so the encoder never stops from a
        // paused stream.
        if live.timer.is_paused() {
            live.timer.resume(self.clock.monotonic());
            let _ = live.capture.commands.send(CaptureCommand::SetPaused(false));
        }
        self.set_state(EngineState::Stopping);

        let (tx, rx) = oneshot::channel();
        let sent = live
            .capture
            .commands
            .send(CaptureCommand::Stop { reply: tx })
            .is_ok();

        let result = if !sent {
            let metadata = Self::best_effort_metadata(&live, self.clock.as_ref());
            Err(StopError::EncoderFailed {
                reason: "capture task unavailable at stop".to_string(),
                metadata,
            })
        } else {
            match tokio::time::timeout(STOP_TIMEOUT, rx).await {
                Ok(Ok(Ok(blob))) => self.finalize_stop(&mut live, blob).await,
                Ok(Ok(Err(encoder_err))) => {
                    let metadata = Self::best_effort_metadata(&live, self.clock.as_ref());
                    self.write_truncated_session(&live, &metadata).await;
                    Err(StopError::EncoderFailed {
                        reason: encoder_err.to_string(),
                        metadata,
                    })
                }
                Ok(Err(_)) => {
                    let metadata = Self::best_effort_metadata(&live, self.clock.as_ref());
                    Err(StopError::EncoderFailed {
                        reason: "capture task terminated before acknowledging stop".to_string(),
                        metadata,
                    })
                }
                Err(_) => {
                    warn!("Encoder did not acknowledge stop within {:?}", STOP_TIMEOUT);
                    live.capture.join.abort();
                    let metadata = Self::best_effort_metadata(&live, self.clock.as_ref());
                    Err(StopError::StopTimeout {
                        timeout_secs: STOP_TIMEOUT.as_secs(),
                        metadata,
                    })
                }
            }
        };

        Self::release_resources(live);
        if let Err(e) = with_retries("recovery clear", || self.recovery.clear()).await {
            warn!("Failed to clear recovery checkpoint: {}", e);
        }
        self.status.recording_changed(false);
        self.set_state(EngineState::Idle);
        self.shared.duration_secs.store(0, Ordering::SeqCst);
        result
    }

    async fn finalize_stop(
        &mut self,
        live: &mut LiveSession,
        blob: Vec<u8>,
    ) -> Result<SessionMetadata, StopError> {
        let now = self.clock.monotonic();
        let duration = live.timer.active_secs(now);

        // The final segment persists only if any audio was captured.
        if !blob.is_empty() {
            self.persist_segment(live, blob, true).await?;
        }

        let session_id = match live.session_id {
            Some(id) => id,
            None => {
                // No chunk ever reached disk and the final blob was empty;
                // the session record still gets written.
                let id = SessionId::generate();
                live.session_id = Some(id);
                id
            }
        };

        let metadata = SessionMetadata {
            session_name: live.name.clone(),
            start_time: live.start_wall,
            duration_seconds: duration,
            file_size_bytes: live.total_bytes,
            format: live.options.format,
            quality_kbps: live.options.quality_kbps,
        };

        with_retries("session finalize", || {
            SessionsRepository::upsert_session(
                self.db.pool(),
                session_id,
                live.created_at_ms,
                &metadata,
            )
        })
        .await
        .map_err(|e| StopError::Storage(StorageError::SessionStoreFailed(e)))?;

        info!(
            "Recording stopped: '{}' ({:.1}s, {} bytes)",
            metadata.session_name, metadata.duration_seconds, metadata.file_size_bytes
        );
        Ok(metadata)
    }

    async fn handle_force_stop(&mut self) -> SessionMetadata {
        info!("Force stop requested");
        let metadata = match self.live.take() {
            Some(live) => {
                live.capture.join.abort();
                let metadata = Self::best_effort_metadata(&live, self.clock.as_ref());
                self.write_truncated_session(&live, &metadata).await;
                Self::release_resources(live);
                metadata
            }
            None => SessionMetadata::synthetic(String::new(), self.clock.now_utc()),
        };

        if let Err(e) = self.recovery.clear().await {
            warn!("Failed to clear recovery checkpoint during force stop: {}", e);
        }
        self.status.recording_changed(false);
        self.set_state(EngineState::Idle);
        self.shared.duration_secs.store(0, Ordering::SeqCst);
        metadata
    }

    /// Best-effort metadata in the synthetic shape: counters we still trust
    /// (name, start, duration) plus zeroed content fields.
    fn best_effort_metadata(live: &LiveSession, clock: &dyn Clock) -> SessionMetadata {
        let mut metadata =
            SessionMetadata::synthetic(live.name.clone(), live.start_wall);
        metadata.duration_seconds = live.timer.active_secs(clock.monotonic());
        metadata
    }

    async fn write_truncated_session(&self, live: &LiveSession, metadata: &SessionMetadata) {
        if let Some(session_id) = live.session_id {
            crate::database::repositories::session::try_upsert_session(
                self.db.pool(),
                session_id,
                live.created_at_ms,
                metadata,
            )
            .await;
        }
    }

    fn release_resources(mut live: LiveSession) {
        live.level_token.cancel();
        if let Some(stream) = live.stream.take() {
            stream.close();
        }
        // The capture task exits on its own once the stop handshake is done
        // or its channels close; callers abort it explicitly when stuck.
    }

    async fn on_capture_event(&mut self, event: CaptureEvent) {
        let Some(mut live) = self.live.take() else {
            return;
        };

        let outcome = self.process_event(&mut live, event).await;
        match outcome {
            EventOutcome::Continue => self.live = Some(live),
            EventOutcome::Failed(alert) => self.enter_failed(live, alert).await,
        }
    }

    async fn process_event(&self, live: &mut LiveSession, event: CaptureEvent) -> EventOutcome {
        match event {
            CaptureEvent::Chunk { epoch, bytes } => {
                live.pending_chunks.fetch_sub(1, Ordering::SeqCst);
                if epoch != live.epoch {
                    // Chunk from an encoder that already finalized; its bytes
                    // are inside the finalized blob.
                    return EventOutcome::Continue;
                }
                match self.state() {
                    EngineState::Recording | EngineState::Paused => {}
                    _ => return EventOutcome::Continue,
                }
                self.handle_chunk(live, bytes).await
            }
            CaptureEvent::DeviceLost(reason) => {
                error!("Input device lost: {}", reason);
                EventOutcome::Failed(EngineAlert::DeviceLost(reason))
            }
            CaptureEvent::EncoderFailed(e) => {
                error!("Encoder failed: {}", e);
                EventOutcome::Failed(EngineAlert::EncoderFailed(e.to_string()))
            }
        }
    }

    async fn handle_chunk(&self, live: &mut LiveSession, bytes: Vec<u8>) -> EventOutcome {
        // Ids are allocated lazily on the first chunk flush.
        if live.session_id.is_none() {
            let session_id = SessionId::generate();
            let metadata = self.session_metadata_snapshot(live);
            let written = with_retries("session create", || {
                SessionsRepository::upsert_session(
                    self.db.pool(),
                    session_id,
                    live.created_at_ms,
                    &metadata,
                )
            })
            .await;
            if let Err(e) = written {
                return EventOutcome::Failed(EngineAlert::PersistenceFailed(e.to_string()));
            }
            live.session_id = Some(session_id);
        }

        let segment_id = match live.segment.id {
            Some(id) => id,
            None => {
                let id = SegmentId::generate();
                live.segment.id = Some(id);
                live.segment.active_start_secs =
                    live.timer.active_secs(self.clock.monotonic());
                live.segment.started_wall = self.clock.now_utc();
                id
            }
        };

        if let Err(e) = self.blobs.append(segment_id, &bytes).await {
            return EventOutcome::Failed(EngineAlert::PersistenceFailed(e.to_string()));
        }
        live.segment.bytes += bytes.len() as u64;
        live.total_bytes += bytes.len() as u64;

        if self.state() == EngineState::Recording {
            if let Some(reason) = self.split_trigger(live) {
                debug!("Split triggered: {}", reason);
                return self.perform_split(live).await;
            }
        }
        EventOutcome::Continue
    }

    fn split_trigger(&self, live: &LiveSession) -> Option<&'static str> {
        if live.segment.id.is_none() {
            return None;
        }
        if let Some(minutes) = live.options.split_interval_minutes {
            let elapsed = self
                .clock
                .monotonic()
                .saturating_sub(live.last_split_mono);
            if elapsed >= Duration::from_secs(minutes as u64 * 60) {
                return Some("interval elapsed");
            }
        }
        if let Some(mb) = live.options.split_size_mb {
            if live.segment.bytes >= mb * 1024 * 1024 {
                return Some("size limit reached");
            }
        }
        if live.pending_chunks.load(Ordering::SeqCst) >= MAX_PENDING_CHUNKS {
            return Some("in-flight chunk ceiling");
        }
        None
    }

    async fn perform_split(&self, live: &mut LiveSession) -> EventOutcome {
        self.set_state(EngineState::Splitting);

        let encoder = match self
            .encoders
            .create(live.options.format, live.options.quality_kbps)
        {
            Ok(encoder) => encoder,
            Err(e) => return EventOutcome::Failed(EngineAlert::EncoderFailed(e.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        if live
            .capture
            .commands
            .send(CaptureCommand::Split { encoder, reply: tx })
            .is_err()
        {
            return EventOutcome::Failed(EngineAlert::EncoderFailed(
                "capture task unavailable for split".to_string(),
            ));
        }

        let blob = match rx.await {
            Ok(Ok(blob)) => blob,
            Ok(Err(e)) => {
                return EventOutcome::Failed(EngineAlert::EncoderFailed(e.to_string()))
            }
            Err(_) => {
                return EventOutcome::Failed(EngineAlert::EncoderFailed(
                    "capture task dropped split acknowledgment".to_string(),
                ))
            }
        };

        // The new encoder owns the stream from here on.
        live.epoch += 1;

        if let Err(e) = self.persist_segment(live, blob, false).await {
            return EventOutcome::Failed(EngineAlert::PersistenceFailed(e.to_string()));
        }

        let now_mono = self.clock.monotonic();
        live.last_split_mono = now_mono;
        live.segment = SegmentProgress {
            id: None,
            bytes: 0,
            active_start_secs: live.timer.active_secs(now_mono),
            started_wall: self.clock.now_utc(),
        };

        self.set_state(EngineState::Recording);
        EventOutcome::Continue
    }

    /// Persist one finalized segment blob and its session-record update.
    async fn persist_segment(
        &self,
        live: &mut LiveSession,
        blob: Vec<u8>,
        is_final: bool,
    ) -> Result<Option<SegmentRef>, StopError> {
        if blob.is_empty() {
            return Ok(None);
        }

        let segment_id = match live.segment.id {
            Some(id) => id,
            None => {
                // Less than one timeslice of audio: no chunk was emitted,
                // but the finalized blob still carries it.
                let id = SegmentId::generate();
                live.segment.id = Some(id);
                id
            }
        };
        let session_id = match live.session_id {
            Some(id) => id,
            None => {
                let id = SessionId::generate();
                live.session_id = Some(id);
                let metadata = self.session_metadata_snapshot(live);
                with_retries("session create", || {
                    SessionsRepository::upsert_session(
                        self.db.pool(),
                        id,
                        live.created_at_ms,
                        &metadata,
                    )
                })
                .await
                .map_err(|e| StopError::Storage(StorageError::SessionStoreFailed(e)))?;
                id
            }
        };

        // The finalized blob replaces the appended chunks (its container
        // header carries the corrected sizes).
        live.total_bytes = live.total_bytes - live.segment.bytes + blob.len() as u64;

        let now = self.clock.monotonic();
        let active_now = live.timer.active_secs(now);
        let segment_duration = (active_now - live.segment.active_start_secs).max(0.0);

        let sequence_index = live.next_sequence;
        let segment_ref = SegmentRef {
            id: segment_id,
            path: BlobStore::relative_path(segment_id),
            display_name: validation::segment_display_name(
                &live.name,
                live.segment.started_wall,
                sequence_index,
            ),
            metadata: SessionMetadata {
                session_name: live.name.clone(),
                start_time: live.start_wall,
                duration_seconds: segment_duration,
                file_size_bytes: blob.len() as u64,
                format: live.options.format,
                quality_kbps: live.options.quality_kbps,
            },
            sequence_index,
        };

        let blob_len = blob.len();
        if let Err(e) = self.blobs.save(segment_id, &blob).await {
            return Err(StopError::Storage(e));
        }

        let session_metadata = self.session_metadata_snapshot(live);
        let appended = with_retries("segment record", || {
            SessionsRepository::append_segment(
                self.db.pool(),
                session_id,
                &segment_ref,
                &session_metadata,
            )
        })
        .await;

        if let Err(e) = appended {
            if is_final {
                // A blob without a session reference must not outlive stop.
                if let Err(cleanup) = self.blobs.delete(segment_id).await {
                    warn!("Failed to remove unreferenced final blob: {}", cleanup);
                }
            }
            return Err(StopError::Storage(StorageError::SessionStoreFailed(e)));
        }

        live.next_sequence = sequence_index + 1;
        debug!(
            "Segment {} persisted ({} bytes, {:.1}s)",
            sequence_index, blob_len, segment_duration
        );
        Ok(Some(segment_ref))
    }

    fn session_metadata_snapshot(&self, live: &LiveSession) -> SessionMetadata {
        SessionMetadata {
            session_name: live.name.clone(),
            start_time: live.start_wall,
            duration_seconds: live.timer.active_secs(self.clock.monotonic()),
            file_size_bytes: live.total_bytes,
            format: live.options.format,
            quality_kbps: live.options.quality_kbps,
        }
    }

    async fn enter_failed(&mut self, mut live: LiveSession, alert: EngineAlert) {
        self.set_state(EngineState::Failed);

        // Whatever already reached disk gets a truncated session record so
        // the catalog can show it.
        let metadata = self.session_metadata_snapshot(&live);
        self.write_truncated_session(&live, &metadata).await;

        // One last checkpoint so the user can recover what was captured.
        let checkpoint = Self::build_checkpoint(&live, self.clock.as_ref(), &metadata);
        if let Err(e) = self.recovery.put(&checkpoint).await {
            warn!("Failed to preserve checkpoint while failing: {}", e);
        }

        live.capture.join.abort();
        Self::release_resources(live);
        self.status.recording_changed(false);
        self.shared.alert(alert);
        error!("Recording entered failed state");
    }

    async fn write_checkpoint(&mut self) {
        let Some(live) = &self.live else {
            return;
        };
        if !matches!(
            self.state(),
            EngineState::Recording | EngineState::Paused | EngineState::Splitting
        ) {
            return;
        }

        let metadata = self.session_metadata_snapshot(live);
        let checkpoint = Self::build_checkpoint(live, self.clock.as_ref(), &metadata);
        // Best effort: a missed checkpoint costs at most five seconds of
        // recovery fidelity.
        if let Err(e) = self.recovery.put(&checkpoint).await {
            warn!("Checkpoint write failed: {}", e);
        }
    }

    fn build_checkpoint(
        live: &LiveSession,
        clock: &dyn Clock,
        metadata: &SessionMetadata,
    ) -> RecoveryCheckpoint {
        let now = clock.monotonic();
        let current_segment_ref = live.segment.id.map(|id| SegmentRef {
            id,
            path: BlobStore::relative_path(id),
            display_name: validation::segment_display_name(
                &live.name,
                live.segment.started_wall,
                live.next_sequence,
            ),
            metadata: SessionMetadata {
                session_name: live.name.clone(),
                start_time: live.start_wall,
                duration_seconds: (live.timer.active_secs(now)
                    - live.segment.active_start_secs)
                    .max(0.0),
                file_size_bytes: live.segment.bytes,
                format: live.options.format,
                quality_kbps: live.options.quality_kbps,
            },
            sequence_index: live.next_sequence,
        });

        RecoveryCheckpoint {
            session_name: live.name.clone(),
            start_time: live.start_wall,
            duration_seconds: live.timer.active_secs(now),
            is_paused: live.timer.is_paused(),
            current_segment_ref,
            metadata: metadata.clone(),
        }
    }
}

fn spawn_level_task(
    shared: Arc<EngineShared>,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut detector = SilenceDetector::new();
        let mut interval = tokio::time::interval(LEVEL_SAMPLE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if shared.state.load() != EngineState::Recording {
                        detector.reset();
                        continue;
                    }
                    let update = shared.meter.read();
                    if let Some(callback) = shared.level_callback.lock().unwrap().as_ref() {
                        callback(update);
                    }
                    if detector.observe(update.rms, clock.monotonic()) {
                        info!("Silence detected");
                        shared.alert(EngineAlert::SilenceDetected);
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::audio::encode::DefaultEncoderFactory;
    use crate::audio::testing::{EncoderBehavior, ScriptedDevicePort, ScriptedEncoderFactory};
    use crate::clock::SystemClock;
    use crate::database::repositories::SessionsRepository;
    use crate::error::DeviceError;
    use crate::ports::{CrashSignal, FilePort, NullStatusPort, StdFilePort};
    use crate::settings::AudioFormat;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        _dir: TempDir,
        db: DatabaseManager,
        blobs: BlobStore,
        recovery: RecoveryStore,
        crash: CrashSignal,
        engine: RecordingEngine,
    }

    impl Harness {
        async fn new(port: ScriptedDevicePort, encoders: Arc<dyn EncoderFactory>) -> Self {
            let dir = tempdir().unwrap();
            let db = DatabaseManager::open(&dir.path().join("t.sqlite")).await.unwrap();
            let files: Arc<dyn FilePort> = Arc::new(StdFilePort);
            let blobs = BlobStore::new(db.pool().clone(), files, dir.path().to_path_buf());
            blobs.ensure_layout().unwrap();
            let recovery = RecoveryStore::new(db.pool().clone());
            let crash = CrashSignal::new();
            let engine = Self::spawn_engine(&db, &blobs, &recovery, &crash, port, encoders);
            Self {
                _dir: dir,
                db,
                blobs,
                recovery,
                crash,
                engine,
            }
        }

        fn spawn_engine(
            db: &DatabaseManager,
            blobs: &BlobStore,
            recovery: &RecoveryStore,
            crash: &CrashSignal,
            port: ScriptedDevicePort,
            encoders: Arc<dyn EncoderFactory>,
        ) -> RecordingEngine {
            RecordingEngine::spawn(EngineParams {
                clock: Arc::new(SystemClock::new()),
                devices: Arc::new(port),
                encoders,
                db: db.clone(),
                blobs: blobs.clone(),
                recovery: recovery.clone(),
                status: Arc::new(NullStatusPort),
                crash: crash.subscribe(),
            })
        }

        /// Replace the engine as if the process restarted; the old engine is
        /// torn down without a clean stop, so the checkpoint stays behind.
        async fn simulate_restart(&mut self, port: ScriptedDevicePort, encoders: Arc<dyn EncoderFactory>) {
            let old = std::mem::replace(
                &mut self.engine,
                Self::spawn_engine(&self.db, &self.blobs, &self.recovery, &self.crash, port, encoders),
            );
            old.shutdown().await;
        }

        async fn sessions(&self) -> Vec<crate::database::models::Session> {
            SessionsRepository::get_all_sessions(self.db.pool()).await.unwrap()
        }

        async fn assert_no_orphans(&self) {
            let referenced: HashSet<String> =
                SessionsRepository::referenced_segment_ids(self.db.pool())
                    .await
                    .unwrap()
                    .into_iter()
                    .collect();
            let orphans = self
                .blobs
                .list_orphans(&referenced, &HashSet::new())
                .await
                .unwrap();
            assert!(orphans.is_empty(), "orphaned blobs: {orphans:?}");
        }
    }

    fn wav_factory() -> Arc<dyn EncoderFactory> {
        Arc::new(DefaultEncoderFactory::new(44_100, 2))
    }

    fn options(interval_min: Option<u32>, size_mb: Option<u64>) -> RecordingOptions {
        RecordingOptions {
            format: AudioFormat::Wav,
            quality_kbps: 320,
            split_interval_minutes: interval_min,
            split_size_mb: size_mb,
            input_device_id: None,
        }
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn clean_short_recording() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        h.engine
            .start_with_options("Goblin Ambush", options(None, None))
            .await
            .unwrap();
        assert_eq!(h.engine.state(), EngineState::Recording);

        sleep_secs(3).await;
        let metadata = h.engine.stop().await.unwrap();

        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(metadata.session_name, "Goblin Ambush");
        assert!(
            (2.0..=4.5).contains(&metadata.duration_seconds),
            "duration {}",
            metadata.duration_seconds
        );

        let sessions = h.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].segments.len(), 1);
        assert_eq!(sessions[0].segments[0].sequence_index, 1);

        // The blob is a WAV container and loads back.
        let blob = h.blobs.load(sessions[0].segments[0].id).await.unwrap();
        assert_eq!(&blob[0..4], b"RIFF");

        // Checkpoint cleared on clean stop.
        assert!(h.recovery.get().await.unwrap().is_none());
        h.assert_no_orphans().await;
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pause_resume_excludes_paused_time() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        h.engine.start_with_options("", options(None, None)).await.unwrap();
        sleep_secs(2).await;
        h.engine.pause().await.unwrap();
        assert_eq!(h.engine.state(), EngineState::Paused);
        sleep_secs(5).await;
        h.engine.resume().await.unwrap();
        sleep_secs(2).await;
        let metadata = h.engine.stop().await.unwrap();

        assert!(
            (3.0..=5.5).contains(&metadata.duration_seconds),
            "duration {}",
            metadata.duration_seconds
        );

        // Empty name synthesized as Session_YYYY-MM-DD_HHMM.
        let re = regex::Regex::new(r"^Session_\d{4}-\d{2}-\d{2}_\d{4}$").unwrap();
        assert!(re.is_match(&metadata.session_name), "{}", metadata.session_name);
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn time_based_splitting() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        h.engine
            .start_with_options("Long One", options(Some(1), None))
            .await
            .unwrap();
        sleep_secs(125).await;
        h.engine.stop().await.unwrap();

        let sessions = h.sessions().await;
        assert_eq!(sessions.len(), 1);
        let segments = &sessions[0].segments;
        assert!(segments.len() >= 3, "expected >= 3 segments, got {}", segments.len());

        let seqs: Vec<u32> = segments.iter().map(|s| s.sequence_index).collect();
        let expected: Vec<u32> = (1..=segments.len() as u32).collect();
        assert_eq!(seqs, expected);

        for segment in &segments[..segments.len() - 1] {
            assert!(
                segment.metadata.duration_seconds <= 62.0,
                "segment {} lasted {}",
                segment.sequence_index,
                segment.metadata.duration_seconds
            );
        }

        // Segment durations cover the session duration.
        let total: f64 = segments.iter().map(|s| s.metadata.duration_seconds).sum();
        let session_duration = sessions[0].metadata.duration_seconds;
        assert!(
            (total - session_duration).abs() <= 2.0,
            "segments cover {total}, session {session_duration}"
        );
        h.assert_no_orphans().await;
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn size_based_splitting() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        h.engine
            .start_with_options("Big One", options(None, Some(1)))
            .await
            .unwrap();
        sleep_secs(16).await;
        h.engine.stop().await.unwrap();

        let sessions = h.sessions().await;
        let segments = &sessions[0].segments;
        assert!(segments.len() >= 2, "expected >= 2 segments, got {}", segments.len());

        // One chunk of 44.1 kHz stereo 16-bit is 176_400 bytes.
        let limit = 1024 * 1024 + 200_000;
        for segment in &segments[..segments.len() - 1] {
            assert!(
                segment.metadata.file_size_bytes <= limit,
                "segment {} is {} bytes",
                segment.sequence_index,
                segment.metadata.file_size_bytes
            );
        }
        h.assert_no_orphans().await;
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn crash_signal_then_recover() {
        let mut h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        h.engine
            .start_with_options("Campaign 5", options(None, None))
            .await
            .unwrap();
        sleep_secs(7).await;

        h.crash.raise();
        sleep_secs(1).await;
        h.simulate_restart(ScriptedDevicePort::realtime(), wav_factory()).await;

        let checkpoint = h.engine.get_recovery_state().await.unwrap().unwrap();
        assert_eq!(checkpoint.session_name, "Campaign 5");
        assert!(checkpoint.duration_seconds >= 5.0, "{}", checkpoint.duration_seconds);
        assert!(checkpoint.current_segment_ref.is_some());

        h.engine.recover(options(None, None)).await.unwrap();
        assert_eq!(h.engine.state(), EngineState::Recording);
        sleep_secs(2).await;
        let metadata = h.engine.stop().await.unwrap();

        assert_eq!(metadata.session_name, "Campaign 5");
        assert!(metadata.duration_seconds >= 8.0, "{}", metadata.duration_seconds);

        // One session: the adopted pre-crash segment plus the new one.
        let sessions = h.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].segments.len() >= 2, "{}", sessions[0].segments.len());
        assert!(h.recovery.get().await.unwrap().is_none());
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_encoder_times_out() {
        let factory: Arc<dyn EncoderFactory> = Arc::new(ScriptedEncoderFactory {
            samples_per_chunk: 88_200,
            behavior: EncoderBehavior::StuckFinalize,
        });
        let h = Harness::new(ScriptedDevicePort::realtime(), factory).await;

        h.engine.start_with_options("Stuck", options(None, None)).await.unwrap();
        sleep_secs(2).await;

        match h.engine.stop().await {
            Err(StopError::StopTimeout { timeout_secs, metadata }) => {
                assert_eq!(timeout_secs, 10);
                assert_eq!(metadata.session_name, "Stuck");
                assert_eq!(metadata.format, AudioFormat::Unknown);
                assert_eq!(metadata.file_size_bytes, 0);
                assert!(metadata.duration_seconds >= 1.0);
            }
            other => panic!("expected StopTimeout, got {other:?}"),
        }

        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.recovery.get().await.unwrap().is_none());
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn device_loss_fails_and_preserves_checkpoint() {
        let mut port = ScriptedDevicePort::realtime();
        port.lose_after = Some(Duration::from_secs(2));
        let h = Harness::new(port, wav_factory()).await;

        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = alerts.clone();
        h.engine.set_alert_callback(move |alert| {
            sink.lock().unwrap().push(format!("{alert:?}"));
        });

        h.engine.start_with_options("Doomed", options(None, None)).await.unwrap();
        sleep_secs(4).await;

        assert_eq!(h.engine.state(), EngineState::Failed);
        assert!(h.recovery.get().await.unwrap().is_some());
        assert!(alerts
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.contains("DeviceLost")));

        // The truncated session made it to the catalog.
        let sessions = h.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].metadata.session_name, "Doomed");

        h.engine.cleanup().await;
        assert_eq!(h.engine.state(), EngineState::Idle);
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_live_is_rejected() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;
        h.engine.start_with_options("First", options(None, None)).await.unwrap();

        match h.engine.start_with_options("Second", options(None, None)).await {
            Err(StartError::State(StateError::AlreadyRecording)) => {}
            other => panic!("expected AlreadyRecording, got {other:?}"),
        }

        h.engine.stop().await.unwrap();
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn control_calls_need_a_live_session() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        assert!(matches!(h.engine.pause().await, Err(StateError::NotRecording)));
        assert!(matches!(h.engine.resume().await, Err(StateError::NotRecording)));
        assert!(matches!(
            h.engine.stop().await,
            Err(StopError::State(StateError::NotRecording))
        ));

        // Pause is only legal while recording, resume only while paused.
        h.engine.start_with_options("S", options(None, None)).await.unwrap();
        assert!(matches!(
            h.engine.resume().await,
            Err(StateError::IllegalTransition { .. })
        ));
        h.engine.stop().await.unwrap();
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pending_checkpoint_blocks_start_until_discard() {
        let mut h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        h.engine.start_with_options("Before", options(None, None)).await.unwrap();
        sleep_secs(6).await;
        h.simulate_restart(ScriptedDevicePort::realtime(), wav_factory()).await;

        match h.engine.start_with_options("After", options(None, None)).await {
            Err(StartError::RecoveryAvailable) => {}
            other => panic!("expected RecoveryAvailable, got {other:?}"),
        }

        h.engine.clear_recovery_state().await.unwrap();
        h.engine.start_with_options("After", options(None, None)).await.unwrap();
        h.engine.stop().await.unwrap();
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recover_without_checkpoint_is_rejected() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;
        match h.engine.recover(options(None, None)).await {
            Err(StartError::RecoveryUnavailable) => {}
            other => panic!("expected RecoveryUnavailable, got {other:?}"),
        }
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_stays_fresh_while_recording() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;
        h.engine.start_with_options("Fresh", options(None, None)).await.unwrap();
        sleep_secs(13).await;

        let checkpoint = h.recovery.get().await.unwrap().unwrap();
        let live = h.engine.live_duration_secs() as f64;
        assert!(
            (live - checkpoint.duration_seconds).abs() <= 5.0,
            "live {live}, checkpoint {}",
            checkpoint.duration_seconds
        );

        h.engine.stop().await.unwrap();
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn force_stop_always_reaches_idle() {
        let factory: Arc<dyn EncoderFactory> = Arc::new(ScriptedEncoderFactory {
            samples_per_chunk: 88_200,
            behavior: EncoderBehavior::StuckFinalize,
        });
        let h = Harness::new(ScriptedDevicePort::realtime(), factory).await;

        h.engine.start_with_options("Wedged", options(None, None)).await.unwrap();
        sleep_secs(2).await;

        let metadata = h.engine.force_stop().await;
        assert_eq!(metadata.session_name, "Wedged");
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert!(h.recovery.get().await.unwrap().is_none());

        // Idle force stop returns synthetic metadata.
        let synthetic = h.engine.force_stop().await;
        assert_eq!(synthetic.format, AudioFormat::Unknown);
        h.engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn device_open_failures_map_to_start_errors() {
        for (fail, expect_no_device) in [
            (DeviceError::NoInputDevice, true),
            (DeviceError::PermissionDenied, false),
        ] {
            let mut port = ScriptedDevicePort::realtime();
            port.fail_open = Some(fail);
            let h = Harness::new(port, wav_factory()).await;

            match h.engine.start_with_options("X", options(None, None)).await {
                Err(StartError::Device(DeviceError::NoInputDevice)) => assert!(expect_no_device),
                Err(StartError::Device(DeviceError::PermissionDenied)) => {
                    assert!(!expect_no_device)
                }
                other => panic!("unexpected: {other:?}"),
            }
            assert_eq!(h.engine.state(), EngineState::Idle);
            h.engine.shutdown().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn level_callback_fires_while_recording() {
        let h = Harness::new(ScriptedDevicePort::realtime(), wav_factory()).await;

        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        h.engine.set_level_callback(move |update| {
            assert!((0.0..=1.0).contains(&update.rms));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.engine.start_with_options("Levels", options(None, None)).await.unwrap();
        sleep_secs(2).await;
        h.engine.stop().await.unwrap();

        // ~60 Hz for two seconds, generously bounded.
        assert!(updates.load(Ordering::SeqCst) >= 30);
        h.engine.shutdown().await;
    }
}
