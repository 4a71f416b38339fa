//! TavernTapes recording core.
//!
//! Records multi-hour audio sessions with pause/resume, automatic
//! segmentation into bounded files, per-segment durable persistence and
//! crash-resilient recovery. The host (GUI, tray, dialogs) stays outside;
//! it talks to [`TavernTapes`], which wires the ports and stores together
//! and hands out the engine and the catalog.

pub mod audio;
pub mod catalog;
pub mod clock;
pub mod database;
pub mod error;
pub mod ports;
pub mod settings;
pub mod validation;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::info;

use crate::audio::recording_engine::RECOVERY_WINDOW_HOURS;
use crate::audio::{
    CpalDevicePort, DefaultEncoderFactory, DevicePort, EngineParams, RecordingEngine,
};
use crate::catalog::Catalog;
use crate::clock::SystemClock;
use crate::database::repositories::{
    BlobStore, RecoveryStore, SessionsRepository, SettingsRepository,
};
use crate::database::DatabaseManager;
use crate::ports::{CrashSignal, FilePort, NullStatusPort, RecordingStatusPort, StdFilePort};
use crate::settings::Settings;

pub use crate::audio::{EngineAlert, EngineState, LevelUpdate};
pub use crate::database::models::{
    RecoveryCheckpoint, SegmentId, SegmentRef, Session, SessionId, SessionMetadata,
};
pub use crate::error::{CatalogError, StartError, StopError, StorageError, ValidationError};
pub use crate::settings::{AudioFormat, RecordingOptions, Theme};

const DB_FILENAME: &str = "taverntapes.sqlite";

/// Where the core keeps its database and recordings.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
}

impl CoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Platform-appropriate default data directory.
    pub fn from_platform_dirs() -> Option<Self> {
        dirs::data_dir().map(|base| Self::new(base.join("TavernTapes")))
    }

    fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILENAME)
    }
}

/// Host collaborators. Desktop hosts take the defaults and override what
/// they implement themselves (tray status, crash notification).
pub struct CorePorts {
    pub devices: Arc<dyn DevicePort>,
    pub files: Arc<dyn FilePort>,
    pub status: Arc<dyn RecordingStatusPort>,
    pub crash: CrashSignal,
}

impl Default for CorePorts {
    fn default() -> Self {
        Self {
            devices: Arc::new(CpalDevicePort),
            files: Arc::new(StdFilePort),
            status: Arc::new(NullStatusPort),
            crash: CrashSignal::new(),
        }
    }
}

/// The assembled core: engine, catalog, settings and stores.
pub struct TavernTapes {
    db: DatabaseManager,
    blobs: BlobStore,
    recovery: RecoveryStore,
    devices: Arc<dyn DevicePort>,
    engine: RecordingEngine,
    catalog: Catalog,
    crash: CrashSignal,
}

impl TavernTapes {
    /// Open the store, run schema migrations and startup maintenance
    /// (stale-checkpoint purge, orphan sweep), then start the engine task.
    pub async fn open(config: CoreConfig, ports: CorePorts) -> anyhow::Result<Self> {
        ports
            .files
            .create_dir(&config.data_dir)
            .context("creating data directory")?;

        let db = DatabaseManager::open(&config.db_path())
            .await
            .context("opening session store")?;

        let settings = SettingsRepository::get_settings(db.pool())
            .await
            .context("reading settings")?;
        let storage_root = resolve_storage_location(&config.data_dir, &settings.storage_location);
        let blobs = BlobStore::new(db.pool().clone(), ports.files.clone(), storage_root);
        blobs.ensure_layout().context("creating recordings directory")?;

        let recovery = RecoveryStore::new(db.pool().clone());
        run_startup_maintenance(&db, &blobs, &recovery).await?;

        let devices = ports.devices;
        let engine = RecordingEngine::spawn(EngineParams {
            clock: Arc::new(SystemClock::new()),
            devices: devices.clone(),
            encoders: Arc::new(DefaultEncoderFactory::new(
                audio::devices::TARGET_SAMPLE_RATE,
                audio::devices::TARGET_CHANNELS,
            )),
            db: db.clone(),
            blobs: blobs.clone(),
            recovery: recovery.clone(),
            status: ports.status,
            crash: ports.crash.subscribe(),
        });
        let catalog = Catalog::new(db.clone(), blobs.clone());

        Ok(Self {
            db,
            blobs,
            recovery,
            devices,
            engine,
            catalog,
            crash: ports.crash,
        })
    }

    /// Available audio input devices, for the host's device picker.
    pub fn list_input_devices(&self) -> Result<Vec<audio::AudioDevice>, error::DeviceError> {
        self.devices.enumerate_inputs()
    }

    pub fn engine(&self) -> &RecordingEngine {
        &self.engine
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn crash_signal(&self) -> &CrashSignal {
        &self.crash
    }

    /// Start a recording with options derived from the current settings.
    pub async fn start_recording(&self, name: &str) -> Result<(), StartError> {
        let options = self.settings().await?.recording_options();
        self.engine.start_with_options(name, options).await
    }

    /// Resume the checkpointed session with options from current settings.
    pub async fn recover_recording(&self) -> Result<(), StartError> {
        let options = self.settings().await?.recording_options();
        self.engine.recover(options).await
    }

    pub async fn settings(&self) -> Result<Settings, StorageError> {
        SettingsRepository::get_settings(self.db.pool())
            .await
            .map_err(StorageError::SessionStoreFailed)
    }

    pub async fn put_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), StorageError> {
        SettingsRepository::put_setting(self.db.pool(), key, value)
            .await
            .map_err(StorageError::SessionStoreFailed)
    }

    /// Atomic multi-key settings update.
    pub async fn update_settings<I>(&self, updates: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        SettingsRepository::update_settings(self.db.pool(), updates)
            .await
            .map_err(StorageError::SessionStoreFailed)
    }

    pub async fn clear_settings(&self) -> Result<(), StorageError> {
        SettingsRepository::clear_settings(self.db.pool())
            .await
            .map_err(StorageError::SessionStoreFailed)
    }

    /// Graceful shutdown: stop any live recording, stop the engine task,
    /// checkpoint the WAL and close the pool.
    pub async fn close(self) -> anyhow::Result<()> {
        match self.engine.state() {
            EngineState::Recording | EngineState::Paused => {
                if let Err(e) = self.engine.stop().await {
                    log::warn!("Recording did not stop cleanly on close: {}", e);
                }
            }
            EngineState::Failed => self.engine.cleanup().await,
            _ => {}
        }
        self.engine.shutdown().await;
        self.db.cleanup().await.context("closing session store")?;
        Ok(())
    }
}

fn resolve_storage_location(data_dir: &Path, location: &str) -> PathBuf {
    let path = Path::new(location);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(location)
    }
}

/// Purge checkpoints past the recovery window and blobs no session owns.
/// The live checkpoint's in-progress segment is shielded from the sweep.
async fn run_startup_maintenance(
    db: &DatabaseManager,
    blobs: &BlobStore,
    recovery: &RecoveryStore,
) -> anyhow::Result<()> {
    if let Some(checkpoint) = recovery.get().await? {
        let age = Utc::now() - checkpoint.start_time;
        if age > chrono::Duration::hours(RECOVERY_WINDOW_HOURS) {
            info!(
                "Discarding recovery checkpoint older than {}h",
                RECOVERY_WINDOW_HOURS
            );
            recovery.clear().await?;
        }
    }

    let protected: HashSet<String> = recovery
        .get()
        .await?
        .iter()
        .filter_map(|cp| cp.current_segment_ref.as_ref())
        .map(|segment| segment.id.as_hex())
        .collect();
    let referenced: HashSet<String> = SessionsRepository::referenced_segment_ids(db.pool())
        .await
        .context("listing referenced segments")?
        .into_iter()
        .collect();
    blobs.purge_orphans(&referenced, &protected).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::ScriptedDevicePort;
    use crate::database::models::{RecoveryCheckpoint, SessionMetadata};
    use serde_json::json;
    use tempfile::tempdir;

    fn test_ports() -> CorePorts {
        CorePorts {
            devices: Arc::new(ScriptedDevicePort::realtime()),
            ..CorePorts::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_stack_record_and_browse() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let core = TavernTapes::open(CoreConfig::new(dir.path()), test_ports())
            .await
            .unwrap();

        core.start_recording("Goblin Ambush").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        let metadata = core.engine().stop().await.unwrap();
        assert_eq!(metadata.session_name, "Goblin Ambush");

        let sessions = core.catalog().list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);

        let id = sessions[0].id;
        core.catalog().add_note(id, "TPK narrowly avoided").await.unwrap();
        let hits = core.catalog().search("narrowly").await.unwrap();
        assert_eq!(hits.len(), 1);

        let export = core.catalog().export(id, None).await.unwrap();
        assert_eq!(&export[0..4], b"RIFF");

        core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn settings_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::new(dir.path());

        let core = TavernTapes::open(config.clone(), test_ports()).await.unwrap();
        core.put_setting("split_interval_minutes", &json!(15)).await.unwrap();
        core.put_setting("quality", &json!(192)).await.unwrap();
        core.close().await.unwrap();

        let core = TavernTapes::open(config, test_ports()).await.unwrap();
        let settings = core.settings().await.unwrap();
        assert_eq!(settings.split_interval_minutes, 15);
        assert_eq!(settings.audio_quality, 192);

        let options = settings.recording_options();
        assert_eq!(options.split_interval_minutes, Some(15));
        assert_eq!(options.quality_kbps, 192);
        core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn startup_purges_stale_checkpoints_and_orphans() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::new(dir.path());

        let core = TavernTapes::open(config.clone(), test_ports()).await.unwrap();

        // Seed an orphan blob and a checkpoint from "25 hours ago".
        let orphan = SegmentId::generate();
        let TavernTapes { blobs, recovery, .. } = &core;
        blobs.save(orphan, b"stray bytes").await.unwrap();
        let stale = RecoveryCheckpoint {
            session_name: "Ancient".to_string(),
            start_time: Utc::now() - chrono::Duration::hours(25),
            duration_seconds: 100.0,
            is_paused: false,
            current_segment_ref: None,
            metadata: SessionMetadata::synthetic("Ancient".to_string(), Utc::now()),
        };
        recovery.put(&stale).await.unwrap();
        core.close().await.unwrap();

        let core = TavernTapes::open(config, test_ports()).await.unwrap();
        assert!(core.engine().get_recovery_state().await.unwrap().is_none());
        assert!(core.blobs.load(orphan).await.is_err());
        core.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_a_live_recording() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::new(dir.path());

        let core = TavernTapes::open(config.clone(), test_ports()).await.unwrap();
        core.start_recording("Interrupted").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        core.close().await.unwrap();

        let core = TavernTapes::open(config, test_ports()).await.unwrap();
        let sessions = core.catalog().list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].metadata.session_name, "Interrupted");
        // A clean close leaves no checkpoint behind.
        assert!(core.engine().get_recovery_state().await.unwrap().is_none());
        core.close().await.unwrap();
    }

    #[test]
    fn storage_location_resolution() {
        let base = Path::new("/data/taverntapes");
        assert_eq!(
            resolve_storage_location(base, "TavernTapes_Recordings"),
            base.join("TavernTapes_Recordings")
        );
        #[cfg(unix)]
        assert_eq!(
            resolve_storage_location(base, "/mnt/external"),
            PathBuf::from("/mnt/external")
        );
    }
}
