//! Core library for the skull sync player.
//!
//! Plays a pre-recorded audio track while driving the skull's servos from a
//! keyframe timeline, using the audio position as the clock. Each module
//! owns one piece: timeline loading and interpolation, calibration, the
//! actuator that writes to the servo bus, gaze input, and the player's
//! control loop that ties them together.

pub mod audio;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod gaze;
pub mod hardware;
pub mod interpolate;
pub mod player;
pub mod session;
pub mod timeline;

pub use audio::{AudioBackend, AudioBackendKind, AudioTransport, SimulatedBackend};
pub use calibration::{Calibration, CalibrationStore, ChannelCalibration, JsonCalibrationStore};
pub use channel::{Channel, ChannelSpec};
pub use config::AppConfig;
pub use error::{AudioOpenError, HardwareWriteError, ParseError, PlayerError, Result};
pub use events::{EventSink, PlayerEvent, ServoEvent, SessionEvent, StopReason};
pub use gaze::{GazeChannel, GazeOverride, GazePose};
pub use hardware::{HardwareActuator, PwmBus, SimulatedBus};
pub use player::{ChannelState, EngineParts, PlayerState, PlayerStatus, SyncPlayer};
pub use session::{DirectorySessions, SessionSource};
pub use timeline::{Keyframe, Timeline};
