pub mod capture;
pub mod devices;
pub mod encode;
pub mod level_meter;
pub mod recording_engine;
pub mod recording_state;

#[cfg(test)]
pub(crate) mod testing;

pub use devices::{AudioDevice, CpalDevicePort, DeviceConfig, DevicePort};
pub use encode::{DefaultEncoderFactory, Encoder, EncoderFactory, CHUNK_TIMESLICE};
pub use level_meter::{LevelMeter, LevelUpdate, SilenceDetector};
pub use recording_engine::{
    EngineAlert, EngineParams, RecordingEngine, CHECKPOINT_INTERVAL, STOP_TIMEOUT,
};
pub use recording_state::EngineState;
