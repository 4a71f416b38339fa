//! PCM encoders.
//!
//! Both encoders consume interleaved f32 frames and emit time-sliced chunks
//! (1 s by default). WAV chunks are prefixes of the streamed blob: the first
//! chunk carries the RIFF header with placeholder sizes, patched when the
//! segment finalizes. The compressed path pipes PCM through a host `ffmpeg`
//! into ADTS AAC; ADTS frames are self-delimiting, so concatenating chunks
//! reproduces the final stream byte for byte.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};

use crate::error::EncoderError;
use crate::settings::AudioFormat;

/// Chunk cadence. One chunk per second of captured audio.
pub const CHUNK_TIMESLICE: Duration = Duration::from_secs(1);

const WAV_HEADER_SIZE: usize = 44;
const BIT_DEPTH: u16 = 16;

/// Locate the host ffmpeg binary used for compressed encoding.
pub fn find_ffmpeg_path() -> Option<PathBuf> {
    which::which("ffmpeg").ok()
}

#[async_trait]
pub trait Encoder: Send {
    fn format(&self) -> AudioFormat;

    /// Push interleaved f32 frames into the encoder.
    fn feed(&mut self, frames: &[f32]) -> Result<(), EncoderError>;

    /// Next time-sliced chunk, if at least one timeslice of audio has been
    /// encoded since the last chunk.
    fn poll_chunk(&mut self) -> Result<Option<Vec<u8>>, EncoderError>;

    /// The full in-progress blob as it stands now.
    fn current_blob(&mut self) -> Result<Vec<u8>, EncoderError>;

    /// Finish the stream and return the complete blob. Returns an empty
    /// buffer when no audio frames were ever fed.
    async fn finalize(self: Box<Self>) -> Result<Vec<u8>, EncoderError>;
}

/// Build one encoder per segment; the engine creates a fresh encoder across
/// every split boundary.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, format: AudioFormat, quality_kbps: u32) -> Result<Box<dyn Encoder>, EncoderError>;
}

pub struct DefaultEncoderFactory {
    pub sample_rate: u32,
    pub channels: u16,
}

impl DefaultEncoderFactory {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl EncoderFactory for DefaultEncoderFactory {
    fn create(&self, format: AudioFormat, quality_kbps: u32) -> Result<Box<dyn Encoder>, EncoderError> {
        match format {
            AudioFormat::Wav => Ok(Box::new(WavEncoder::new(self.sample_rate, self.channels))),
            AudioFormat::Compressed => Ok(Box::new(FfmpegAacEncoder::spawn(
                self.sample_rate,
                self.channels,
                quality_kbps,
            )?)),
            AudioFormat::Unknown => Err(EncoderError::ConstraintFailed(
                "cannot encode to an unknown format".to_string(),
            )),
        }
    }
}

/// 44-byte RIFF/WAVE header for 16-bit PCM.
fn wav_header(sample_rate: u32, channels: u16, data_size: u32) -> [u8; WAV_HEADER_SIZE] {
    let byte_rate = sample_rate * channels as u32 * BIT_DEPTH as u32 / 8;
    let block_align = channels * BIT_DEPTH / 8;
    let chunk_size = 36u32.wrapping_add(data_size);

    let mut header = [0u8; WAV_HEADER_SIZE];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&chunk_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&BIT_DEPTH.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());
    header
}

/// Size value used while the stream is still growing. Readers that honor the
/// streaming convention treat it as "until end of file".
const STREAMING_SIZE: u32 = u32::MAX;

/// 16-bit PCM WAV encoder.
pub struct WavEncoder {
    sample_rate: u32,
    channels: u16,
    /// Encoded PCM payload, header excluded.
    data: Vec<u8>,
    /// Payload bytes already emitted through `poll_chunk`.
    emitted_data: usize,
    header_emitted: bool,
    samples_since_chunk: usize,
    samples_per_chunk: usize,
}

impl WavEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            data: Vec::new(),
            emitted_data: 0,
            header_emitted: false,
            samples_since_chunk: 0,
            samples_per_chunk: (sample_rate as usize) * (channels as usize),
        }
    }
}

#[async_trait]
impl Encoder for WavEncoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::Wav
    }

    fn feed(&mut self, frames: &[f32]) -> Result<(), EncoderError> {
        self.data.reserve(frames.len() * 2);
        for &sample in frames {
            let clamped = sample.clamp(-1.0, 1.0);
            let quantized = (clamped * i16::MAX as f32) as i16;
            self.data.extend_from_slice(&quantized.to_le_bytes());
        }
        self.samples_since_chunk += frames.len();
        Ok(())
    }

    fn poll_chunk(&mut self) -> Result<Option<Vec<u8>>, EncoderError> {
        if self.samples_since_chunk < self.samples_per_chunk {
            return Ok(None);
        }
        self.samples_since_chunk = 0;

        let mut chunk = Vec::with_capacity(
            (self.data.len() - self.emitted_data) + WAV_HEADER_SIZE,
        );
        if !self.header_emitted {
            chunk.extend_from_slice(&wav_header(
                self.sample_rate,
                self.channels,
                STREAMING_SIZE,
            ));
            self.header_emitted = true;
        }
        chunk.extend_from_slice(&self.data[self.emitted_data..]);
        self.emitted_data = self.data.len();
        Ok(Some(chunk))
    }

    fn current_blob(&mut self) -> Result<Vec<u8>, EncoderError> {
        let mut blob = Vec::with_capacity(WAV_HEADER_SIZE + self.data.len());
        blob.extend_from_slice(&wav_header(
            self.sample_rate,
            self.channels,
            self.data.len() as u32,
        ));
        blob.extend_from_slice(&self.data);
        Ok(blob)
    }

    async fn finalize(mut self: Box<Self>) -> Result<Vec<u8>, EncoderError> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }
        self.current_blob()
    }
}

/// Number of leading bytes in `buf` forming complete ADTS frames. Anything
/// past that is a partial frame and stays buffered for the next chunk.
fn complete_adts_frames(buf: &[u8]) -> usize {
    let mut offset = 0;
    while offset + 7 <= buf.len() {
        // 12-bit syncword.
        if buf[offset] != 0xFF || buf[offset + 1] & 0xF0 != 0xF0 {
            // Lost sync; flush everything up to here and let the remainder
            // resync on the next pass.
            break;
        }
        let frame_len = ((buf[offset + 3] as usize & 0x03) << 11)
            | ((buf[offset + 4] as usize) << 3)
            | ((buf[offset + 5] as usize) >> 5);
        if frame_len < 7 || offset + frame_len > buf.len() {
            break;
        }
        offset += frame_len;
    }
    offset
}

/// Compressed encoder: pipes f32-le PCM through a host ffmpeg into ADTS AAC
/// at the configured bitrate. A reader thread drains stdout so the encoder
/// pipe never backs up.
pub struct FfmpegAacEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    collected: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    /// ADTS-aligned bytes already emitted as chunks.
    emitted: usize,
    samples_since_chunk: usize,
    samples_per_chunk: usize,
    fed_any: bool,
}

impl FfmpegAacEncoder {
    pub fn spawn(sample_rate: u32, channels: u16, bitrate_kbps: u32) -> Result<Self, EncoderError> {
        let ffmpeg_path = find_ffmpeg_path().ok_or_else(|| {
            EncoderError::ConstraintFailed(
                "ffmpeg not found; install ffmpeg to record compressed audio".to_string(),
            )
        })?;
        debug!("Using ffmpeg at {:?}", ffmpeg_path);

        let mut command = Command::new(ffmpeg_path);
        command
            .args([
                "-f",
                "f32le",
                "-ar",
                &sample_rate.to_string(),
                "-ac",
                &channels.to_string(),
                "-i",
                "pipe:0",
                "-c:a",
                "aac",
                "-b:a",
                &format!("{bitrate_kbps}k"),
                "-f",
                "adts",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command
            .spawn()
            .map_err(|e| EncoderError::Internal(format!("failed to spawn ffmpeg: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Internal("ffmpeg stdin unavailable".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncoderError::Internal("ffmpeg stdout unavailable".to_string()))?;

        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut sink = sink.lock().expect("encoder output lock");
                        sink.extend_from_slice(&buf[..n]);
                    }
                    Err(e) => {
                        warn!("ffmpeg stdout read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            collected,
            reader: Some(reader),
            emitted: 0,
            samples_since_chunk: 0,
            samples_per_chunk: (sample_rate as usize) * (channels as usize),
            fed_any: false,
        })
    }
}

#[async_trait]
impl Encoder for FfmpegAacEncoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::Compressed
    }

    fn feed(&mut self, frames: &[f32]) -> Result<(), EncoderError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncoderError::Internal("encoder already finalized".to_string()))?;
        stdin
            .write_all(bytemuck::cast_slice(frames))
            .map_err(|e| EncoderError::Internal(format!("ffmpeg pipe write failed: {e}")))?;
        self.samples_since_chunk += frames.len();
        self.fed_any = true;
        Ok(())
    }

    fn poll_chunk(&mut self) -> Result<Option<Vec<u8>>, EncoderError> {
        if self.samples_since_chunk < self.samples_per_chunk {
            return Ok(None);
        }
        self.samples_since_chunk = 0;

        let collected = self.collected.lock().expect("encoder output lock");
        let fresh = &collected[self.emitted..];
        let aligned = complete_adts_frames(fresh);
        if aligned == 0 {
            return Ok(None);
        }
        let chunk = fresh[..aligned].to_vec();
        self.emitted += aligned;
        Ok(Some(chunk))
    }

    fn current_blob(&mut self) -> Result<Vec<u8>, EncoderError> {
        Ok(self.collected.lock().expect("encoder output lock").clone())
    }

    async fn finalize(mut self: Box<Self>) -> Result<Vec<u8>, EncoderError> {
        // Closing stdin signals end of stream; ffmpeg flushes and exits.
        drop(self.stdin.take());

        let Some(mut child) = self.child.take() else {
            return Err(EncoderError::Internal("encoder already finalized".to_string()));
        };
        let reader = self.reader.take();
        let collected = self.collected.clone();
        let fed_any = self.fed_any;

        tokio::task::spawn_blocking(move || {
            let status = child
                .wait()
                .map_err(|e| EncoderError::Internal(format!("ffmpeg wait failed: {e}")))?;
            if let Some(handle) = reader {
                let _ = handle.join();
            }
            if !status.success() && fed_any {
                error!("ffmpeg exited with {}", status);
                return Err(EncoderError::Internal(format!(
                    "ffmpeg exited with {status}"
                )));
            }
            let blob = collected.lock().expect("encoder output lock").clone();
            Ok(blob)
        })
        .await
        .map_err(|e| EncoderError::Internal(format!("encoder finalize task failed: {e}")))?
    }
}

impl Drop for FfmpegAacEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
