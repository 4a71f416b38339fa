//! Input device enumeration and capture streams.
//!
//! Frames are forwarded from the driver callback thread into an unbounded
//! channel as interleaved f32 samples; the capture task drains them. Device
//! loss is delivered in-band so ordering against the last frames is kept.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::DeviceError;

pub const TARGET_SAMPLE_RATE: u32 = 44_100;
pub const TARGET_CHANNELS: u16 = 2;

/// One enumerated input device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
}

/// Requested capture constraints. The processing hints mirror what browser
/// capture stacks expose; backends that cannot honor them log and continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// `None` selects the host default input.
    pub device_id: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            channels: TARGET_CHANNELS,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_id: None,
        }
    }
}

/// Events flowing out of an open device.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Interleaved f32 samples at the configured rate and channel count.
    Frames(Vec<f32>),
    /// The device disappeared mid-stream.
    Lost(String),
}

/// Handle keeping the capture stream alive. Dropping without `close` also
/// stops capture, but `close` pauses callbacks first so no frame lands after
/// the channel is gone.
pub trait DeviceStream: Send {
    fn close(self: Box<Self>);
}

pub struct OpenedDevice {
    pub events: mpsc::UnboundedReceiver<DeviceEvent>,
    pub stream: Box<dyn DeviceStream>,
}

/// Port the engine consumes; the cpal implementation below is the production
/// backend, tests substitute scripted ones.
pub trait DevicePort: Send + Sync {
    fn enumerate_inputs(&self) -> Result<Vec<AudioDevice>, DeviceError>;
    fn open(&self, config: &DeviceConfig) -> Result<OpenedDevice, DeviceError>;
}

/// cpal-backed device port using the host's default audio backend.
#[derive(Debug, Default)]
pub struct CpalDevicePort;

impl DevicePort for CpalDevicePort {
    fn enumerate_inputs(&self) -> Result<Vec<AudioDevice>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| DeviceError::DeviceLost(e.to_string()))?;

        let mut inputs = Vec::new();
        for device in devices {
            let name = device.name().unwrap_or_else(|_| "Unknown input".to_string());
            inputs.push(AudioDevice {
                id: name.clone(),
                label: name,
            });
        }
        if inputs.is_empty() {
            return Err(DeviceError::NoInputDevice);
        }
        Ok(inputs)
    }

    fn open(&self, config: &DeviceConfig) -> Result<OpenedDevice, DeviceError> {
        let host = cpal::default_host();

        let device = match &config.device_id {
            Some(wanted) => host
                .input_devices()
                .map_err(|e| DeviceError::DeviceLost(e.to_string()))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                .ok_or(DeviceError::NoInputDevice)?,
            None => host.default_input_device().ok_or(DeviceError::NoInputDevice)?,
        };
        let label = device.name().unwrap_or_else(|_| "default".to_string());

        if config.echo_cancellation || config.noise_suppression || config.auto_gain_control {
            // cpal exposes no processing knobs; the OS capture path decides.
            log::debug!("Audio processing hints are not controllable through this backend");
        }

        let supported = device
            .supported_input_configs()
            .map_err(|e| map_open_error(&e.to_string()))?
            .find(|range| {
                range.channels() == config.channels
                    && range.min_sample_rate().0 <= config.sample_rate
                    && range.max_sample_rate().0 >= config.sample_rate
            })
            .ok_or(DeviceError::ConstraintsUnsatisfiable)?
            .with_sample_rate(cpal::SampleRate(config.sample_rate));

        info!(
            "Opening input '{}': {} Hz, {} ch, {:?}",
            label,
            config.sample_rate,
            config.channels,
            supported.sample_format()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = build_stream(&device, &supported, tx)?;

        stream
            .play()
            .map_err(|e| DeviceError::DeviceLost(e.to_string()))?;

        Ok(OpenedDevice {
            events: rx,
            stream: Box::new(CpalStream {
                stream,
                label,
            }),
        })
    }
}

fn map_open_error(msg: &str) -> DeviceError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        DeviceError::PermissionDenied
    } else {
        DeviceError::DeviceLost(msg.to_string())
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    tx: mpsc::UnboundedSender<DeviceEvent>,
) -> Result<cpal::Stream, DeviceError> {
    let stream_config: cpal::StreamConfig = config.clone().into();
    let err_tx = tx.clone();
    let error_handler = move |err: cpal::StreamError| {
        warn!("Input stream error: {}", err);
        let _ = err_tx.send(DeviceEvent::Lost(err.to_string()));
    };

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(DeviceEvent::Frames(data.to_vec()));
            },
            error_handler,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data
                    .iter()
                    .map(|&sample| sample as f32 / i16::MAX as f32)
                    .collect();
                let _ = tx.send(DeviceEvent::Frames(samples));
            },
            error_handler,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data
                    .iter()
                    .map(|&sample| (sample as f32 / u16::MAX as f32) * 2.0 - 1.0)
                    .collect();
                let _ = tx.send(DeviceEvent::Frames(samples));
            },
            error_handler,
            None,
        ),
        other => {
            return Err(DeviceError::DeviceLost(format!(
                "unsupported sample format: {other:?}"
            )))
        }
    };

    stream.map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NoInputDevice,
        cpal::BuildStreamError::StreamConfigNotSupported => DeviceError::ConstraintsUnsatisfiable,
        other => map_open_error(&other.to_string()),
    })
}

struct CpalStream {
    stream: cpal::Stream,
    label: String,
}

// SAFETY: the stream is only touched from close(), which pauses callbacks
// before dropping; cpal streams are not Sync and we never share one.
unsafe impl Send for CpalStream {}

impl DeviceStream for CpalStream {
    fn close(self: Box<Self>) {
        // Pause first so callbacks stop before the stream drops and the
        // channel sender is released.
        if let Err(e) = self.stream.pause() {
            warn!("Failed to pause stream before drop: {}", e);
        }
        info!("Input stream for '{}' closed", self.label);
    }
}
