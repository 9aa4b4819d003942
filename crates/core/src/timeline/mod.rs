use std::{collections::BTreeMap, path::Path};

use crate::{error::ParseError, Channel, PlayerError};

mod schema;

pub use schema::FRAME_PERIOD_MS;

/// A single timed target angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    pub time_ms: u64,
    pub value_degrees: f64,
}

impl Keyframe {
    pub fn new(time_ms: u64, value_degrees: f64) -> Self {
        Self {
            time_ms,
            value_degrees,
        }
    }
}

/// Canonical motion timeline: per channel, keyframes with strictly
/// increasing times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    tracks: BTreeMap<Channel, Vec<Keyframe>>,
    duration_ms: u64,
}

impl Timeline {
    /// Parses any of the accepted JSON encodings.
    pub fn load(raw: &[u8]) -> Result<Self, ParseError> {
        schema::load(raw)
    }

    pub fn load_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        Self::load(&raw).map_err(PlayerError::from)
    }

    /// Builds a timeline from unordered keyframes. Each track is sorted by
    /// time; at a repeated timestamp the keyframe seen last wins.
    pub fn from_tracks(
        tracks: impl IntoIterator<Item = (Channel, Vec<Keyframe>)>,
        duration_ms: u64,
    ) -> Self {
        let mut merged: BTreeMap<Channel, Vec<Keyframe>> = BTreeMap::new();
        for (channel, keyframes) in tracks {
            merged.entry(channel).or_default().extend(keyframes);
        }

        let mut normalized = BTreeMap::new();
        for (channel, mut keyframes) in merged {
            // Stable sort keeps input order among equal timestamps.
            keyframes.sort_by_key(|keyframe| keyframe.time_ms);
            let mut deduped: Vec<Keyframe> = Vec::with_capacity(keyframes.len());
            for keyframe in keyframes {
                match deduped.last_mut() {
                    Some(last) if last.time_ms == keyframe.time_ms => *last = keyframe,
                    _ => deduped.push(keyframe),
                }
            }
            if !deduped.is_empty() {
                normalized.insert(channel, deduped);
            }
        }
        Self {
            tracks: normalized,
            duration_ms,
        }
    }

    pub fn keyframes(&self, channel: Channel) -> Option<&[Keyframe]> {
        self.tracks.get(&channel).map(Vec::as_slice)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.tracks.keys().copied()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Time of the last keyframe over all channels.
    pub fn last_keyframe_ms(&self) -> u64 {
        self.tracks
            .values()
            .filter_map(|track| track.last())
            .map(|keyframe| keyframe.time_ms)
            .max()
            .unwrap_or(0)
    }
}
