//! Scripted encoders and device ports shared by the audio tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::devices::{AudioDevice, DeviceConfig, DeviceEvent, DevicePort, DeviceStream, OpenedDevice};
use super::encode::{Encoder, EncoderFactory};
use crate::error::{DeviceError, EncoderError};
use crate::settings::AudioFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderBehavior {
    Normal,
    /// `finalize` never resolves; used to exercise the stop timeout.
    StuckFinalize,
    /// `feed` fails immediately.
    FailFeed,
}

/// Deterministic encoder: one output byte per input sample, chunked on the
/// same timeslice cadence as the real encoders.
pub struct ScriptedEncoder {
    data: Vec<u8>,
    emitted: usize,
    samples_since_chunk: usize,
    samples_per_chunk: usize,
    behavior: EncoderBehavior,
}

impl ScriptedEncoder {
    pub fn new(samples_per_chunk: usize) -> Self {
        Self::with_behavior(samples_per_chunk, EncoderBehavior::Normal)
    }

    pub fn with_behavior(samples_per_chunk: usize, behavior: EncoderBehavior) -> Self {
        Self {
            data: Vec::new(),
            emitted: 0,
            samples_since_chunk: 0,
            samples_per_chunk,
            behavior,
        }
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::Wav
    }

    fn feed(&mut self, frames: &[f32]) -> Result<(), EncoderError> {
        if self.behavior == EncoderBehavior::FailFeed {
            return Err(EncoderError::Internal("scripted feed failure".to_string()));
        }
        self.data.extend(std::iter::repeat(0x5A).take(frames.len()));
        self.samples_since_chunk += frames.len();
        Ok(())
    }

    fn poll_chunk(&mut self) -> Result<Option<Vec<u8>>, EncoderError> {
        if self.samples_since_chunk < self.samples_per_chunk {
            return Ok(None);
        }
        self.samples_since_chunk = 0;
        let chunk = self.data[self.emitted..].to_vec();
        self.emitted = self.data.len();
        Ok(Some(chunk))
    }

    fn current_blob(&mut self) -> Result<Vec<u8>, EncoderError> {
        Ok(self.data.clone())
    }

    async fn finalize(self: Box<Self>) -> Result<Vec<u8>, EncoderError> {
        if self.behavior == EncoderBehavior::StuckFinalize {
            std::future::pending::<()>().await;
        }
        Ok(self.data)
    }
}

pub struct ScriptedEncoderFactory {
    pub samples_per_chunk: usize,
    pub behavior: EncoderBehavior,
}

impl EncoderFactory for ScriptedEncoderFactory {
    fn create(&self, _format: AudioFormat, _quality_kbps: u32) -> Result<Box<dyn Encoder>, EncoderError> {
        Ok(Box::new(ScriptedEncoder::with_behavior(
            self.samples_per_chunk,
            self.behavior,
        )))
    }
}

/// Device port emitting a constant-amplitude signal in fixed batches on the
/// tokio clock, so paused-time tests advance it deterministically.
pub struct ScriptedDevicePort {
    pub batch_interval: Duration,
    pub samples_per_batch: usize,
    pub amplitude: f32,
    pub fail_open: Option<DeviceError>,
    /// Emit a device-loss event after this much capture time.
    pub lose_after: Option<Duration>,
}

impl ScriptedDevicePort {
    /// 100 ms batches of 44.1 kHz stereo.
    pub fn realtime() -> Self {
        Self {
            batch_interval: Duration::from_millis(100),
            samples_per_batch: 8820,
            amplitude: 0.5,
            fail_open: None,
            lose_after: None,
        }
    }
}

impl DevicePort for ScriptedDevicePort {
    fn enumerate_inputs(&self) -> Result<Vec<AudioDevice>, DeviceError> {
        Ok(vec![AudioDevice {
            id: "mock".to_string(),
            label: "Mock Microphone".to_string(),
        }])
    }

    fn open(&self, _config: &DeviceConfig) -> Result<OpenedDevice, DeviceError> {
        if let Some(err) = &self.fail_open {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let task_token = token.clone();
        let interval = self.batch_interval;
        let samples = self.samples_per_batch;
        let amplitude = self.amplitude;
        let lose_after = self.lose_after;

        tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        elapsed += interval;
                        if let Some(limit) = lose_after {
                            if elapsed >= limit {
                                let _ = tx.send(DeviceEvent::Lost("device unplugged".to_string()));
                                break;
                            }
                        }
                        if tx.send(DeviceEvent::Frames(vec![amplitude; samples])).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(OpenedDevice {
            events: rx,
            stream: Box::new(ScriptedStream { token }),
        })
    }
}

struct ScriptedStream {
    token: CancellationToken,
}

impl DeviceStream for ScriptedStream {
    fn close(self: Box<Self>) {
        self.token.cancel();
    }
}
