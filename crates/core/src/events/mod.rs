//! Structured events emitted to an external logger.

use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::{hardware::ActuatorCommand, Channel};

/// One actuator command as sent to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoEvent {
    pub timestamp: SystemTime,
    pub channel: Channel,
    pub commanded_angle: f64,
    /// Microseconds.
    #[serde(rename = "pulse_width")]
    pub pulse_width_us: f64,
    pub audio_elapsed_ms: u64,
}

impl ServoEvent {
    pub fn from_command(command: &ActuatorCommand, audio_elapsed_ms: u64) -> Self {
        Self {
            timestamp: SystemTime::now(),
            channel: command.channel,
            commanded_angle: command.calibrated_angle,
            pulse_width_us: command.pulse_us,
            audio_elapsed_ms,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit stop command.
    Requested,
    /// The track played out.
    Completed,
    /// Replaced by a new play command.
    Interrupted,
    /// Hardware fault.
    Fault,
    /// The player itself shut down.
    Shutdown,
}

/// Per-session counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub ticks: u64,
    pub servo_commands: u64,
    /// Ticks that ran noticeably later than scheduled.
    pub late_ticks: u64,
    pub final_elapsed_ms: u64,
    pub expected_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEventKind {
    Started { duration_ms: u64 },
    Paused { elapsed_ms: u64 },
    Resumed { elapsed_ms: u64 },
    Stopped { reason: StopReason, stats: SessionStats },
    Fault { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub timestamp: SystemTime,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, kind: SessionEventKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            session_id: session_id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    Servo(ServoEvent),
    Session(SessionEvent),
}

/// Consumer of player events. Called from the control loop, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PlayerEvent);
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PlayerEvent) {}
}

/// Writes events through `tracing`; servo commands at trace level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PlayerEvent) {
        match event {
            PlayerEvent::Servo(servo) => tracing::trace!(
                channel = %servo.channel,
                angle = servo.commanded_angle,
                pulse_us = servo.pulse_width_us,
                elapsed_ms = servo.audio_elapsed_ms,
                "servo"
            ),
            PlayerEvent::Session(session) => match session.kind {
                SessionEventKind::Fault { message } => {
                    tracing::error!(session = %session.session_id, %message, "session fault")
                }
                SessionEventKind::Stopped { reason, stats } => tracing::info!(
                    session = %session.session_id,
                    ?reason,
                    ticks = stats.ticks,
                    commands = stats.servo_commands,
                    late_ticks = stats.late_ticks,
                    elapsed_ms = stats.final_elapsed_ms,
                    expected_ms = stats.expected_duration_ms,
                    "session stopped"
                ),
                kind => tracing::info!(session = %session.session_id, ?kind, "session event"),
            },
        }
    }
}

/// Forwards events over a channel. Full channels drop events rather than
/// stall the control loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<PlayerEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<PlayerEvent>) -> Self {
        Self { sender }
    }

    /// Sink plus the receiving end, buffering up to `capacity` events.
    pub fn bounded(capacity: usize) -> (Self, Receiver<PlayerEvent>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self::new(sender), receiver)
    }

    pub fn unbounded() -> (Self, Receiver<PlayerEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self::new(sender), receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: PlayerEvent) {
        if self.sender.try_send(event).is_err() {
            tracing::debug!("event channel full or closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_events_serialize_with_kind_tag() {
        let event = PlayerEvent::Session(SessionEvent::new(
            "intro",
            SessionEventKind::Fault {
                message: "bus".into(),
            },
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session");
        assert_eq!(json["kind"], "fault");
        assert_eq!(json["session_id"], "intro");
    }

    #[test]
    fn servo_events_use_the_logger_field_names() {
        let command = ActuatorCommand {
            channel: Channel::Jaw,
            requested_angle: 150.0,
            calibrated_angle: 150.0,
            pulse_us: Channel::Jaw.spec().pulse_for(150.0),
        };
        let json = serde_json::to_value(ServoEvent::from_command(&command, 420)).unwrap();

        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["audio_elapsed_ms", "channel", "commanded_angle", "pulse_width", "timestamp"]
        );
        assert_eq!(json["channel"], "jaw");
        assert_eq!(json["audio_elapsed_ms"], 420);
    }

    #[test]
    fn bounded_sink_drops_when_full() {
        let (sink, receiver) = ChannelSink::bounded(1);
        for _ in 0..3 {
            sink.emit(PlayerEvent::Session(SessionEvent::new(
                "s",
                SessionEventKind::Paused { elapsed_ms: 0 },
            )));
        }
        assert_eq!(receiver.len(), 1);
    }
}
