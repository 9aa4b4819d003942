use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    audio::AudioBackendKind,
    gaze::{CenteringGains, GazeOverride},
    hardware::RetryPolicy,
    Channel, PlayerError, Result,
};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub player: PlayerConfig,
    pub audio: AudioConfig,
    pub hardware: HardwareConfig,
    pub gaze: GazeConfig,
    pub paths: PathsConfig,
}

impl AppConfig {
    /// Reads a JSON config file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|err| PlayerError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.player.tick_hz == 0 {
            return Err(PlayerError::Config("player.tick_hz must be positive".into()));
        }
        if self.hardware.write_attempts == 0 {
            return Err(PlayerError::Config("hardware.write_attempts must be positive".into()));
        }
        let tick = self.player.tick_period();
        let backoff = self.hardware.worst_case_backoff();
        if backoff >= tick {
            return Err(PlayerError::Config(format!(
                "hardware retry backoff totals {} ms, longer than one {:.1} ms tick",
                backoff.as_millis(),
                tick.as_secs_f64() * 1000.0
            )));
        }
        for (name, gain) in [("gaze.eye_gain", self.gaze.eye_gain), ("gaze.neck_gain", self.gaze.neck_gain)] {
            if !gain.is_finite() {
                return Err(PlayerError::Config(format!("{name} must be finite")));
            }
        }
        for (name, gains) in [
            ("gaze.neck_centering", &self.gaze.neck_centering),
            ("gaze.eye_centering", &self.gaze.eye_centering),
        ] {
            gains
                .check()
                .map_err(|reason| PlayerError::Config(format!("{name}: {reason}")))?;
        }
        if self.gaze.override_channels.contains(&Channel::Jaw) {
            return Err(PlayerError::Config("gaze.override_channels cannot include jaw".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub tick_hz: u32,
    /// A tick that starts this much later than scheduled counts as late.
    pub lag_warning_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60,
            lag_warning_ms: 50,
        }
    }
}

impl PlayerConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }

    pub fn lag_warning(&self) -> Duration {
        Duration::from_millis(self.lag_warning_ms)
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub backend: AudioBackendKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub write_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            retry_backoff_ms: 2,
        }
    }
}

impl HardwareConfig {
    /// Total sleep of one write that uses every attempt.
    pub fn worst_case_backoff(&self) -> Duration {
        let retries = u64::from(self.write_attempts.saturating_sub(1));
        let steps = retries * (retries + 1) / 2;
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(steps))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.write_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GazeConfig {
    /// Whether gaze tracking starts enabled.
    pub enabled: bool,
    pub staleness_ms: u64,
    pub override_channels: Vec<Channel>,
    pub eye_gain: f64,
    pub neck_gain: f64,
    pub listen_addr: SocketAddr,
    pub neck_centering: CenteringGains,
    pub eye_centering: CenteringGains,
}

impl Default for GazeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            staleness_ms: 500,
            override_channels: vec![Channel::EyeLeft, Channel::EyeRight, Channel::NeckPan],
            eye_gain: 1.0,
            neck_gain: 1.0,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5005)),
            neck_centering: CenteringGains::NECK,
            eye_centering: CenteringGains::EYES,
        }
    }
}

impl GazeConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn override_policy(&self) -> GazeOverride {
        GazeOverride::new(
            self.enabled,
            self.override_channels.iter().copied(),
            self.eye_gain,
            self.neck_gain,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub sessions_dir: PathBuf,
    pub calibration_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("data"),
            calibration_file: PathBuf::from("config/calibration.json"),
        }
    }
}
