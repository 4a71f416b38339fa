//! Engine state machine primitives and active-time accounting.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle of the recording engine. `Starting`, `Splitting` and `Stopping`
/// are transient; control operations only ever observe the four stable
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Starting = 1,
    Recording = 2,
    Paused = 3,
    Splitting = 4,
    Stopping = 5,
    Failed = 6,
}

impl EngineState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Starting,
            2 => EngineState::Recording,
            3 => EngineState::Paused,
            4 => EngineState::Splitting,
            5 => EngineState::Stopping,
            6 => EngineState::Failed,
            _ => EngineState::Idle,
        }
    }

    /// A session is live in every state except `Idle` and `Failed`.
    pub fn is_live(&self) -> bool {
        !matches!(self, EngineState::Idle | EngineState::Failed)
    }
}

/// Atomic cell so the handle and the sampler tasks can read state without
/// asking the engine task.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: EngineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Accumulates active (non-paused) time from monotonic readings. Wall time
/// spent paused never reaches the duration counter.
#[derive(Debug, Clone)]
pub struct SessionTimer {
    accumulated: Duration,
    resumed_at: Option<Duration>,
}

impl SessionTimer {
    pub fn start(now: Duration) -> Self {
        Self {
            accumulated: Duration::ZERO,
            resumed_at: Some(now),
        }
    }

    /// Resume counting from a recovered checkpoint's duration.
    pub fn with_offset(offset: Duration, now: Duration) -> Self {
        Self {
            accumulated: offset,
            resumed_at: Some(now),
        }
    }

    pub fn pause(&mut self, now: Duration) {
        if let Some(resumed_at) = self.resumed_at.take() {
            self.accumulated += now.saturating_sub(resumed_at);
        }
    }

    pub fn resume(&mut self, now: Duration) {
        if self.resumed_at.is_none() {
            self.resumed_at = Some(now);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.resumed_at.is_none()
    }

    /// Total active time as of `now`. Non-decreasing.
    pub fn active(&self, now: Duration) -> Duration {
        match self.resumed_at {
            Some(resumed_at) => self.accumulated + now.saturating_sub(resumed_at),
            None => self.accumulated,
        }
    }

    pub fn active_secs(&self, now: Duration) -> f64 {
        self.active(now).as_secs_f64()
    }
}
