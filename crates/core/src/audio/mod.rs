//! Audio transports. The transport's playback position, not a wall clock
//! kept by the engine, is the timing reference for the control loop.

use std::{
    fs::File,
    path::Path,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{error::AudioOpenError, Result};

#[cfg(feature = "audio")]
mod output;

#[cfg(feature = "audio")]
pub use output::RodioBackend;

/// Which backend plays the session track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioBackendKind {
    /// Wall-clock playback without sound output.
    #[default]
    Simulated,
    /// Decode and play through the default output device.
    Rodio,
}

/// What the engine asks a backend to open.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub path: &'a Path,
    /// Timeline length, for transports that cannot measure the track.
    pub expected_duration_ms: u64,
}

/// A single opened track.
pub trait AudioTransport {
    /// Current playback position. Does not advance while paused.
    fn position_ms(&self) -> u64;
    /// Track length, when the decoder knows it.
    fn duration_ms(&self) -> Option<u64>;
    /// True once the track has played out or was stopped.
    fn is_finished(&self) -> bool;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
}

/// Opens tracks. Lives on the control-loop thread.
pub trait AudioBackend: Send {
    fn open(&mut self, request: &OpenRequest<'_>) -> std::result::Result<Box<dyn AudioTransport>, AudioOpenError>;
}

/// Builds the backend selected in configuration.
pub fn backend_for(kind: AudioBackendKind) -> Result<Box<dyn AudioBackend>> {
    match kind {
        AudioBackendKind::Simulated => Ok(Box::new(SimulatedBackend)),
        #[cfg(feature = "audio")]
        AudioBackendKind::Rodio => Ok(Box::new(RodioBackend)),
        #[cfg(not(feature = "audio"))]
        AudioBackendKind::Rodio => Err(crate::PlayerError::Config(
            "rodio output requested but the `audio` feature is disabled".into(),
        )),
    }
}

/// Pausable monotonic clock.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl PlaybackClock {
    /// A clock that is already running.
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    pub fn start_at(now: Instant) -> Self {
        Self {
            accumulated: Duration::ZERO,
            running_since: Some(now),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + now.saturating_duration_since(since),
            None => self.accumulated,
        }
    }

    pub fn pause_at(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    pub fn resume_at(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }
}

/// Silent transport that advances with the wall clock.
#[derive(Debug, Clone)]
pub struct ClockTransport {
    clock: PlaybackClock,
    duration_ms: u64,
    stopped: bool,
}

impl ClockTransport {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            clock: PlaybackClock::start(),
            duration_ms,
            stopped: false,
        }
    }
}

impl AudioTransport for ClockTransport {
    fn position_ms(&self) -> u64 {
        let elapsed = self.clock.elapsed().as_millis() as u64;
        elapsed.min(self.duration_ms)
    }

    fn duration_ms(&self) -> Option<u64> {
        Some(self.duration_ms)
    }

    fn is_finished(&self) -> bool {
        self.stopped || self.position_ms() >= self.duration_ms
    }

    fn pause(&mut self) {
        self.clock.pause_at(Instant::now());
    }

    fn resume(&mut self) {
        self.clock.resume_at(Instant::now());
    }

    fn stop(&mut self) {
        self.clock.pause_at(Instant::now());
        self.stopped = true;
    }
}

/// Checks the track is readable, then plays it silently for as long as the
/// timeline lasts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedBackend;

impl AudioBackend for SimulatedBackend {
    fn open(&mut self, request: &OpenRequest<'_>) -> std::result::Result<Box<dyn AudioTransport>, AudioOpenError> {
        let file = File::open(request.path).map_err(|err| AudioOpenError::new(request.path, err.to_string()))?;
        let metadata = file
            .metadata()
            .map_err(|err| AudioOpenError::new(request.path, err.to_string()))?;
        if !metadata.is_file() {
            return Err(AudioOpenError::new(request.path, "not a regular file"));
        }
        if metadata.len() == 0 {
            return Err(AudioOpenError::new(request.path, "file is empty"));
        }
        tracing::debug!(path = %request.path.display(), duration_ms = request.expected_duration_ms, "simulated audio opened");
        Ok(Box::new(ClockTransport::new(request.expected_duration_ms)))
    }
}
