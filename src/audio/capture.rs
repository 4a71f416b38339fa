//! Capture task: the single consumer of the device frame stream.
//!
//! Frames are metered, fed to the live encoder and surfaced to the engine as
//! time-sliced chunks. Encoder swaps happen between frames on this task, so
//! a split can never drop or interleave samples: the new encoder is installed
//! first, then the old one finalizes. Chunks carry the segment epoch so the
//! engine can tell which encoder produced them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::warn;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::devices::DeviceEvent;
use super::encode::Encoder;
use super::level_meter::LevelMeter;
use crate::error::EncoderError;

pub enum CaptureCommand {
    SetPaused(bool),
    /// Install `encoder` for the next segment and finalize the current one.
    Split {
        encoder: Box<dyn Encoder>,
        reply: oneshot::Sender<Result<Vec<u8>, EncoderError>>,
    },
    /// Finalize and shut the capture task down.
    Stop {
        reply: oneshot::Sender<Result<Vec<u8>, EncoderError>>,
    },
}

#[derive(Debug)]
pub enum CaptureEvent {
    Chunk { epoch: u64, bytes: Vec<u8> },
    DeviceLost(String),
    EncoderFailed(EncoderError),
}

pub struct CaptureHandle {
    pub commands: mpsc::UnboundedSender<CaptureCommand>,
    pub join: JoinHandle<()>,
}

pub fn spawn_capture(
    frames: mpsc::UnboundedReceiver<DeviceEvent>,
    encoder: Box<dyn Encoder>,
    meter: Arc<LevelMeter>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    pending_chunks: Arc<AtomicUsize>,
) -> CaptureHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let task = CaptureTask {
        frames,
        frames_done: false,
        commands: cmd_rx,
        events,
        encoder: Some(encoder),
        meter,
        paused: false,
        epoch: 0,
        pending_chunks,
    };
    CaptureHandle {
        commands: cmd_tx,
        join: tokio::spawn(task.run()),
    }
}

struct CaptureTask {
    frames: mpsc::UnboundedReceiver<DeviceEvent>,
    frames_done: bool,
    commands: mpsc::UnboundedReceiver<CaptureCommand>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    encoder: Option<Box<dyn Encoder>>,
    meter: Arc<LevelMeter>,
    paused: bool,
    epoch: u64,
    pending_chunks: Arc<AtomicUsize>,
}

impl CaptureTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(CaptureCommand::SetPaused(paused)) => {
                        self.paused = paused;
                        if paused {
                            self.meter.reset();
                        }
                    }
                    Some(CaptureCommand::Split { encoder, reply }) => {
                        let old = self.encoder.replace(encoder);
                        self.epoch += 1;
                        let result = match old {
                            Some(old) => old.finalize().await,
                            None => Err(EncoderError::Internal(
                                "no live encoder to split".to_string(),
                            )),
                        };
                        let _ = reply.send(result);
                    }
                    Some(CaptureCommand::Stop { reply }) => {
                        let result = match self.encoder.take() {
                            Some(encoder) => encoder.finalize().await,
                            None => Ok(Vec::new()),
                        };
                        let _ = reply.send(result);
                        break;
                    }
                    None => break,
                },

                frame = Self::next_frame(&mut self.frames, self.frames_done) => match frame {
                    Some(DeviceEvent::Frames(samples)) => self.on_frames(&samples),
                    Some(DeviceEvent::Lost(reason)) => {
                        let _ = self.events.send(CaptureEvent::DeviceLost(reason));
                    }
                    None => {
                        // Stream handle dropped. If no stop command arrived
                        // first this is a device loss; either way stop
                        // polling the closed channel.
                        self.frames_done = true;
                        let _ = self
                            .events
                            .send(CaptureEvent::DeviceLost("input stream ended".to_string()));
                    }
                },
            }
        }
    }

    async fn next_frame(
        frames: &mut mpsc::UnboundedReceiver<DeviceEvent>,
        done: bool,
    ) -> Option<DeviceEvent> {
        if done {
            std::future::pending().await
        } else {
            frames.recv().await
        }
    }

    fn on_frames(&mut self, samples: &[f32]) {
        self.meter.ingest(samples);
        if self.paused {
            // Paused audio is discarded, not buffered.
            return;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };

        if let Err(e) = encoder.feed(samples) {
            warn!("Encoder rejected frames: {}", e);
            let _ = self.events.send(CaptureEvent::EncoderFailed(e));
            return;
        }

        loop {
            match encoder.poll_chunk() {
                Ok(Some(bytes)) => {
                    self.pending_chunks.fetch_add(1, Ordering::SeqCst);
                    let _ = self.events.send(CaptureEvent::Chunk {
                        epoch: self.epoch,
                        bytes,
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Encoder chunk poll failed: {}", e);
                    let _ = self.events.send(CaptureEvent::EncoderFailed(e));
                    break;
                }
            }
        }
    }
}
