//! The playback state machine. Everything here runs on the control-loop
//! thread; [`super::SyncPlayer`] is the only owner in production, tests
//! drive it directly with explicit tick times.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    audio::{AudioBackend, AudioTransport, OpenRequest},
    calibration::CalibrationStore,
    error::{CommandKind, HardwareWriteError},
    events::{EventSink, PlayerEvent, ServoEvent, SessionEvent, SessionEventKind, SessionStats, StopReason},
    gaze::{CenteringFollower, GazeChannel, GazeOverride},
    hardware::{ActuatorCommand, HardwareActuator},
    interpolate,
    session::SessionSource,
    Channel, PlayerError, Result, Timeline,
};

use super::{ChannelState, PlayerState, PlayerStatus};

/// Collaborators handed to the engine. Built on any thread, then moved to
/// the control loop.
pub struct EngineParts {
    pub actuator: HardwareActuator,
    pub audio: Box<dyn AudioBackend>,
    pub sessions: Box<dyn SessionSource>,
    pub calibration: Box<dyn CalibrationStore>,
    pub gaze: GazeChannel,
    pub gaze_override: GazeOverride,
    pub follower: CenteringFollower,
    pub sink: Arc<dyn EventSink>,
    pub lag_warning: Duration,
}

/// A command from the web layer, applied between ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Play(String),
    Pause,
    Resume,
    Stop,
    SetChannelEnabled(Channel, bool),
    SetOffset(Channel, f64),
    ReloadCalibration,
    SetGazeTracking(bool),
}

struct ActiveSession {
    id: String,
    timeline: Timeline,
    transport: Box<dyn AudioTransport>,
    /// Track length when the transport knows it; otherwise the session ends
    /// when the transport reports it has finished.
    end_at_ms: Option<u64>,
    started_at_audio_pos_ms: u64,
    elapsed_ms: u64,
    stats: SessionStats,
}

pub struct Engine {
    state: PlayerState,
    actuator: HardwareActuator,
    audio: Box<dyn AudioBackend>,
    sessions: Box<dyn SessionSource>,
    calibration: Box<dyn CalibrationStore>,
    gaze: GazeChannel,
    gaze_override: GazeOverride,
    follower: CenteringFollower,
    sink: Arc<dyn EventSink>,
    lag_warning: Duration,
    active: Option<ActiveSession>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            state: PlayerState::Idle,
            actuator: parts.actuator,
            audio: parts.audio,
            sessions: parts.sessions,
            calibration: parts.calibration,
            gaze: parts.gaze,
            gaze_override: parts.gaze_override,
            follower: parts.follower,
            sink: parts.sink,
            lag_warning: parts.lag_warning,
            active: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Play(session_id) => self.play(&session_id),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::SetChannelEnabled(channel, enabled) => {
                self.set_channel_enabled(channel, enabled);
                Ok(())
            }
            Command::SetOffset(channel, degrees) => {
                self.set_offset(channel, degrees);
                Ok(())
            }
            Command::ReloadCalibration => self.reload_calibration(),
            Command::SetGazeTracking(enabled) => {
                self.set_gaze_tracking(enabled);
                Ok(())
            }
        }
    }

    /// Starts `session_id`, interrupting any session already running.
    /// Load and open failures leave the player idle.
    pub fn play(&mut self, session_id: &str) -> Result<()> {
        if self.active.is_some() {
            tracing::info!(session = session_id, "interrupting current session");
            // A parking failure is reported as a fault event on the
            // interrupted session; the new session still gets its chance.
            let _ = self.end_session(StopReason::Interrupted);
        }

        let assets = self.sessions.resolve(session_id)?;
        let timeline = Timeline::load(&assets.timeline_json)?;

        match self.calibration.load() {
            Ok(calibration) => self.actuator.reload_calibration(calibration),
            Err(err) => tracing::warn!(error = %err, "calibration reload failed, keeping current values"),
        }

        let transport = self.audio.open(&OpenRequest {
            path: &assets.audio_path,
            expected_duration_ms: timeline.duration_ms(),
        })?;
        let end_at_ms = transport.duration_ms();
        let started_at_audio_pos_ms = transport.position_ms();
        let expected_duration_ms = end_at_ms.unwrap_or(timeline.duration_ms());

        tracing::info!(
            session = session_id,
            channels = timeline.channels().count(),
            timeline_ms = timeline.duration_ms(),
            audio_ms = ?end_at_ms,
            "playback started"
        );
        self.active = Some(ActiveSession {
            id: session_id.to_string(),
            timeline,
            transport,
            end_at_ms,
            started_at_audio_pos_ms,
            elapsed_ms: started_at_audio_pos_ms,
            stats: SessionStats {
                expected_duration_ms,
                ..Default::default()
            },
        });
        self.state = PlayerState::Playing;
        self.emit_session(
            session_id,
            SessionEventKind::Started {
                duration_ms: expected_duration_ms,
            },
        );
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        let session = match (self.state, self.active.as_mut()) {
            (PlayerState::Playing, Some(session)) => session,
            (from, _) => return Err(rejected(from, CommandKind::Pause)),
        };
        session.transport.pause();
        session.elapsed_ms = session.transport.position_ms();
        let (id, elapsed_ms) = (session.id.clone(), session.elapsed_ms);

        self.state = PlayerState::Paused;
        tracing::info!(session = %id, elapsed_ms, "playback paused");
        self.emit_session(&id, SessionEventKind::Paused { elapsed_ms });
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        let session = match (self.state, self.active.as_mut()) {
            (PlayerState::Paused, Some(session)) => session,
            (from, _) => return Err(rejected(from, CommandKind::Resume)),
        };
        session.transport.resume();
        let (id, elapsed_ms) = (session.id.clone(), session.transport.position_ms());

        self.state = PlayerState::Playing;
        tracing::info!(session = %id, elapsed_ms, "playback resumed");
        self.emit_session(&id, SessionEventKind::Resumed { elapsed_ms });
        Ok(())
    }

    /// Ends the session and parks every enabled channel at neutral.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            PlayerState::Playing | PlayerState::Paused => {
                self.end_session(StopReason::Requested)?;
                Ok(())
            }
            from => Err(rejected(from, CommandKind::Stop)),
        }
    }

    /// Stops whatever is running before the engine goes away.
    pub fn shutdown(&mut self) {
        if self.active.is_some() {
            let _ = self.end_session(StopReason::Shutdown);
        }
    }

    pub fn set_channel_enabled(&mut self, channel: Channel, enabled: bool) {
        self.actuator.set_enabled(channel, enabled);
        self.persist_calibration();
    }

    pub fn set_offset(&mut self, channel: Channel, degrees: f64) {
        self.actuator.set_offset(channel, degrees);
        self.persist_calibration();
    }

    pub fn reload_calibration(&mut self) -> Result<()> {
        let calibration = self.calibration.load()?;
        self.actuator.reload_calibration(calibration);
        tracing::info!("calibration reloaded");
        Ok(())
    }

    pub fn set_gaze_tracking(&mut self, enabled: bool) {
        if self.gaze_override.enabled != enabled {
            tracing::info!(enabled, "gaze tracking changed");
            self.gaze_override.enabled = enabled;
            self.follower.pause();
        }
    }

    fn persist_calibration(&self) {
        if let Err(err) = self.calibration.save(&self.actuator.calibration()) {
            tracing::warn!(error = %err, "failed to persist calibration");
        }
    }

    /// Accounts for how late the worker woke up for this tick.
    pub fn record_lag(&mut self, lag: Duration) {
        if lag <= self.lag_warning || self.state != PlayerState::Playing {
            return;
        }
        if let Some(session) = self.active.as_mut() {
            session.stats.late_ticks += 1;
            if session.stats.late_ticks % 10 == 1 {
                tracing::warn!(
                    session = %session.id,
                    lag_ms = lag.as_millis() as u64,
                    late_ticks = session.stats.late_ticks,
                    "control loop running late"
                );
            }
        }
    }

    /// One control-loop iteration.
    pub fn tick(&mut self, now: Instant) {
        match self.state {
            PlayerState::Playing => self.tick_session(now),
            PlayerState::Idle => self.tick_idle(now),
            PlayerState::Paused => {}
        }
    }

    fn tick_session(&mut self, now: Instant) {
        let Some(session) = self.active.as_mut() else {
            self.state = PlayerState::Idle;
            return;
        };

        let elapsed_ms = session.transport.position_ms();
        session.elapsed_ms = elapsed_ms;
        session.stats.ticks += 1;

        let reached_end = session.end_at_ms.is_some_and(|end| elapsed_ms >= end);
        if reached_end || session.transport.is_finished() {
            tracing::info!(session = %session.id, elapsed_ms, "track finished");
            // Parking failures are reported as a fault event.
            let _ = self.end_session(StopReason::Completed);
            return;
        }

        let pose = self.gaze.current_pose_at(now);
        let mut fault = None;
        for channel in Channel::ALL {
            let timeline_value = interpolate::value_at(&session.timeline, channel, elapsed_ms);
            let target = self.gaze_override.resolve(channel, timeline_value, pose.as_ref());
            match self.actuator.write(channel, target) {
                Ok(Some(command)) => {
                    session.stats.servo_commands += 1;
                    self.sink
                        .emit(PlayerEvent::Servo(ServoEvent::from_command(&command, elapsed_ms)));
                }
                Ok(None) => {}
                Err(err) => {
                    fault = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = fault {
            self.fail_session(err);
        }
    }

    fn tick_idle(&mut self, now: Instant) {
        if !self.gaze_override.enabled {
            return;
        }
        let Some(pose) = self.gaze.current_pose_at(now) else {
            self.follower.pause();
            return;
        };
        for (channel, angle) in self.follower.step(&pose, now, self.gaze_override.channels()) {
            match self.actuator.write(channel, angle) {
                Ok(Some(command)) => self.sink.emit(PlayerEvent::Servo(ServoEvent::from_command(&command, 0))),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "gaze centering write failed");
                    self.follower.pause();
                    return;
                }
            }
        }
    }

    fn fail_session(&mut self, err: HardwareWriteError) {
        let id = self
            .active
            .as_ref()
            .map(|session| session.id.clone())
            .unwrap_or_default();
        tracing::error!(session = %id, error = %err, "hardware fault, stopping session");
        self.emit_session(
            &id,
            SessionEventKind::Fault {
                message: err.to_string(),
            },
        );
        let _ = self.end_session(StopReason::Fault);
    }

    /// The Stop effect: close audio, park at neutral, go idle.
    fn end_session(&mut self, reason: StopReason) -> std::result::Result<(), HardwareWriteError> {
        let Some(mut session) = self.active.take() else {
            self.state = PlayerState::Idle;
            return Ok(());
        };
        session.transport.stop();

        let sink = &self.sink;
        let elapsed_ms = session.elapsed_ms;
        let mut parked = 0;
        let result = self.actuator.neutral(|command: &ActuatorCommand| {
            parked += 1;
            sink.emit(PlayerEvent::Servo(ServoEvent::from_command(command, elapsed_ms)));
        });
        session.stats.servo_commands += parked;
        session.stats.final_elapsed_ms = elapsed_ms;

        self.state = PlayerState::Idle;
        self.follower.reset();
        // A fault-driven stop already reported its own fault.
        if let (Err(err), false) = (&result, reason == StopReason::Fault) {
            self.emit_session(
                &session.id,
                SessionEventKind::Fault {
                    message: format!("parking at neutral failed: {err}"),
                },
            );
        }
        tracing::info!(
            session = %session.id,
            ?reason,
            elapsed_ms,
            started_at_ms = session.started_at_audio_pos_ms,
            "playback stopped"
        );
        self.emit_session(
            &session.id,
            SessionEventKind::Stopped {
                reason,
                stats: session.stats,
            },
        );
        result
    }

    fn emit_session(&self, session_id: &str, kind: SessionEventKind) {
        self.sink
            .emit(PlayerEvent::Session(SessionEvent::new(session_id, kind)));
    }

    pub fn status(&self) -> PlayerStatus {
        let calibration = self.actuator.calibration();
        let channel_states = Channel::ALL
            .iter()
            .map(|&channel| {
                let last = self.actuator.last_command(channel);
                ChannelState {
                    channel,
                    enabled: calibration.is_enabled(channel),
                    offset_degrees: calibration.offset(channel),
                    last_angle: last.map(|command| command.calibrated_angle),
                    last_pulse_us: last.map(|command| command.pulse_us),
                }
            })
            .collect();

        PlayerStatus {
            state: self.state,
            elapsed_ms: self.active.as_ref().map(|session| session.elapsed_ms),
            session_id: self.active.as_ref().map(|session| session.id.clone()),
            channel_states,
            gaze_tracking: self.gaze_override.enabled,
            gaze_fresh: self.gaze.current_pose().is_some(),
        }
    }
}

fn rejected(from: PlayerState, command: CommandKind) -> PlayerError {
    PlayerError::InvalidStateTransition { from, command }
}
