//! Persisted per-channel corrections and the enable mask.
//!
//! The live engine only ever sees an immutable [`Calibration`] snapshot;
//! changes produce a new snapshot that replaces the old one wholesale.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Channel, PlayerError, Result};

/// Offsets outside this range are treated as configuration mistakes.
pub const MAX_OFFSET_DEGREES: f64 = 45.0;

/// Correction and enable flag for a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    #[serde(default)]
    pub offset_degrees: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            offset_degrees: 0.0,
            enabled: true,
        }
    }
}

/// Snapshot of every channel's calibration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "CalibrationFile", into = "CalibrationFile")]
pub struct Calibration {
    channels: [ChannelCalibration; 4],
}

impl Calibration {
    pub fn get(&self, channel: Channel) -> ChannelCalibration {
        self.channels[channel.index()]
    }

    pub fn offset(&self, channel: Channel) -> f64 {
        self.get(channel).offset_degrees
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        self.get(channel).enabled
    }

    /// Returns a copy with the offset replaced, clamped to
    /// [`MAX_OFFSET_DEGREES`].
    pub fn with_offset(&self, channel: Channel, degrees: f64) -> Self {
        let mut next = self.clone();
        next.channels[channel.index()].offset_degrees = clamp_offset(channel, degrees);
        next
    }

    pub fn with_enabled(&self, channel: Channel, enabled: bool) -> Self {
        let mut next = self.clone();
        next.channels[channel.index()].enabled = enabled;
        next
    }
}

fn clamp_offset(channel: Channel, degrees: f64) -> f64 {
    if !degrees.is_finite() {
        tracing::warn!(%channel, degrees, "ignoring non-finite calibration offset");
        return 0.0;
    }
    let clamped = degrees.clamp(-MAX_OFFSET_DEGREES, MAX_OFFSET_DEGREES);
    if clamped != degrees {
        tracing::warn!(%channel, requested = degrees, clamped, "calibration offset clamped");
    }
    clamped
}

/// On-disk form: a map keyed by channel name. Older files store a bare
/// offset number per channel, which is still accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
struct CalibrationFile(BTreeMap<String, StoredEntry>);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Offset(f64),
    Full(ChannelCalibration),
}

impl From<CalibrationFile> for Calibration {
    fn from(file: CalibrationFile) -> Self {
        let mut calibration = Calibration::default();
        for (name, entry) in file.0 {
            let Ok(channel) = name.parse::<Channel>() else {
                tracing::debug!(name, "ignoring calibration for unknown channel");
                continue;
            };
            let mut value = match entry {
                StoredEntry::Offset(offset) => ChannelCalibration {
                    offset_degrees: offset,
                    ..Default::default()
                },
                StoredEntry::Full(value) => value,
            };
            value.offset_degrees = clamp_offset(channel, value.offset_degrees);
            calibration.channels[channel.index()] = value;
        }
        calibration
    }
}

impl From<Calibration> for CalibrationFile {
    fn from(calibration: Calibration) -> Self {
        CalibrationFile(
            Channel::ALL
                .iter()
                .map(|channel| {
                    (
                        channel.as_str().to_string(),
                        StoredEntry::Full(calibration.get(*channel)),
                    )
                })
                .collect(),
        )
    }
}

/// Where calibration lives between runs.
pub trait CalibrationStore: Send {
    fn load(&self) -> Result<Calibration>;
    fn save(&self, calibration: &Calibration) -> Result<()>;
}

/// JSON file store. A missing file means "all defaults".
#[derive(Debug)]
pub struct JsonCalibrationStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn load(&self) -> Result<Calibration> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no calibration file, using defaults");
                return Ok(Calibration::default());
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            PlayerError::Calibration(format!("{}: {err}", self.path.display()))
        })
    }

    fn save(&self, calibration: &Calibration) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(calibration)
            .map_err(|err| PlayerError::Calibration(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store; clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryCalibrationStore {
    inner: Arc<Mutex<Calibration>>,
}

impl MemoryCalibrationStore {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(calibration)),
        }
    }

    /// Replaces the stored value as an external editor would.
    pub fn replace(&self, calibration: Calibration) {
        *self.inner.lock() = calibration;
    }

    pub fn snapshot(&self) -> Calibration {
        self.inner.lock().clone()
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn load(&self) -> Result<Calibration> {
        Ok(self.snapshot())
    }

    fn save(&self, calibration: &Calibration) -> Result<()> {
        self.replace(calibration.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCalibrationStore::new(dir.path().join("calibration.json"));
        assert_eq!(store.load().unwrap(), Calibration::default());
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCalibrationStore::new(dir.path().join("config/calibration.json"));
        let calibration = Calibration::default()
            .with_offset(Channel::EyeLeft, -14.0)
            .with_enabled(Channel::NeckPan, false);

        store.save(&calibration).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.offset(Channel::EyeLeft), -14.0);
        assert!(!loaded.is_enabled(Channel::NeckPan));
        assert!(loaded.is_enabled(Channel::Jaw));
    }

    #[test]
    fn accepts_bare_offsets_and_ignores_unknown_channels() {
        let json = r#"{"eye_left": -14, "tail": 3, "jaw": {"enabled": false}}"#;
        let calibration: Calibration = serde_json::from_str(json).unwrap();

        assert_eq!(calibration.offset(Channel::EyeLeft), -14.0);
        assert!(calibration.is_enabled(Channel::EyeLeft));
        assert!(!calibration.is_enabled(Channel::Jaw));
        assert_eq!(calibration.offset(Channel::Jaw), 0.0);
    }

    #[test]
    fn offsets_are_clamped() {
        let calibration = Calibration::default().with_offset(Channel::Jaw, 90.0);
        assert_eq!(calibration.offset(Channel::Jaw), MAX_OFFSET_DEGREES);

        let loaded: Calibration = serde_json::from_str(r#"{"jaw": -100}"#).unwrap();
        assert_eq!(loaded.offset(Channel::Jaw), -MAX_OFFSET_DEGREES);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = JsonCalibrationStore::new(&path).load().unwrap_err();
        assert!(matches!(err, PlayerError::Calibration(_)));
    }
}
