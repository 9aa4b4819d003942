//! The synchronized player: one control-loop thread that owns the audio
//! transport and the actuator, driven by commands from any thread.

mod engine;

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use crossbeam_channel::{select, Receiver, Sender};
use serde::Serialize;

pub use engine::{Command, Engine, EngineParts};

use crate::{Channel, PlayerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
}

/// Per-channel view for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub channel: Channel,
    pub enabled: bool,
    pub offset_degrees: f64,
    pub last_angle: Option<f64>,
    pub last_pulse_us: Option<f64>,
}

/// Snapshot of the player, refreshed after every command and tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub elapsed_ms: Option<u64>,
    pub session_id: Option<String>,
    pub channel_states: Vec<ChannelState>,
    pub gaze_tracking: bool,
    pub gaze_fresh: bool,
}

impl PlayerStatus {
    fn idle() -> Self {
        Self {
            state: PlayerState::Idle,
            elapsed_ms: None,
            session_id: None,
            channel_states: Vec::new(),
            gaze_tracking: false,
            gaze_fresh: false,
        }
    }
}

struct Request {
    command: Command,
    reply: Sender<Result<()>>,
}

/// Handle to the control-loop thread. Commands block until the loop has
/// applied them; dropping the handle stops playback and joins the thread.
pub struct SyncPlayer {
    requests: Option<Sender<Request>>,
    status: Arc<ArcSwap<PlayerStatus>>,
    worker: Option<JoinHandle<()>>,
}

impl SyncPlayer {
    /// Starts the control loop, ticking every `tick_period`.
    pub fn spawn(parts: EngineParts, tick_period: Duration) -> Result<Self> {
        let (requests, inbox) = crossbeam_channel::unbounded();
        let status = Arc::new(ArcSwap::from_pointee(PlayerStatus::idle()));
        let published = Arc::clone(&status);

        let worker = thread::Builder::new()
            .name("skull-sync-control".into())
            .spawn(move || run_control_loop(parts, inbox, published, tick_period))?;

        tracing::info!(tick_ms = tick_period.as_secs_f64() * 1000.0, "player started");
        Ok(Self {
            requests: Some(requests),
            status,
            worker: Some(worker),
        })
    }

    pub fn play(&self, session_id: &str) -> Result<()> {
        self.send(Command::Play(session_id.to_string()))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    pub fn set_channel_enabled(&self, channel: Channel, enabled: bool) -> Result<()> {
        self.send(Command::SetChannelEnabled(channel, enabled))
    }

    pub fn set_offset(&self, channel: Channel, degrees: f64) -> Result<()> {
        self.send(Command::SetOffset(channel, degrees))
    }

    pub fn reload_calibration(&self) -> Result<()> {
        self.send(Command::ReloadCalibration)
    }

    pub fn set_gaze_tracking(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetGazeTracking(enabled))
    }

    /// Latest published snapshot. Never blocks on the control loop.
    pub fn status(&self) -> PlayerStatus {
        PlayerStatus::clone(&self.status.load())
    }

    pub fn state(&self) -> PlayerState {
        self.status.load().state
    }

    fn send(&self, command: Command) -> Result<()> {
        let requests = self.requests.as_ref().ok_or(PlayerError::WorkerGone)?;
        let (reply, response) = crossbeam_channel::bounded(1);
        requests
            .send(Request { command, reply })
            .map_err(|_| PlayerError::WorkerGone)?;
        response.recv().map_err(|_| PlayerError::WorkerGone)?
    }

    /// Stops any session, parks the servos and waits for the loop to exit.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        // Closing the request channel is the shutdown signal.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("control loop panicked");
            }
        }
    }
}

impl Drop for SyncPlayer {
    fn drop(&mut self) {
        self.join();
    }
}

impl std::fmt::Debug for SyncPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPlayer")
            .field("state", &self.state())
            .field("running", &self.worker.is_some())
            .finish()
    }
}

fn run_control_loop(
    parts: EngineParts,
    inbox: Receiver<Request>,
    status: Arc<ArcSwap<PlayerStatus>>,
    tick_period: Duration,
) {
    // Built here: audio output handles may not leave the thread that made them.
    let mut engine = Engine::new(parts);
    status.store(Arc::new(engine.status()));
    let ticker = crossbeam_channel::tick(tick_period);

    loop {
        select! {
            recv(inbox) -> request => {
                let Ok(Request { command, reply }) = request else {
                    break;
                };
                tracing::debug!(?command, "applying command");
                let result = engine.apply(command);
                if let Err(err) = &result {
                    tracing::warn!(error = %err, "command failed");
                }
                status.store(Arc::new(engine.status()));
                let _ = reply.send(result);
            }
            recv(ticker) -> scheduled => {
                let now = Instant::now();
                if let Ok(scheduled) = scheduled {
                    engine.record_lag(now.saturating_duration_since(scheduled));
                }
                engine.tick(now);
                status.store(Arc::new(engine.status()));
            }
        }
    }

    engine.shutdown();
    status.store(Arc::new(engine.status()));
    tracing::info!("control loop stopped");
}
