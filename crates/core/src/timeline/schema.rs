//! The accepted JSON encodings and their normalisation.
//!
//! Shapes are tried in a fixed priority order. A shape either does not match
//! structurally (the next one is tried and the reason is kept for the final
//! diagnostic) or matches, after which any bad keyframe is a hard error.

use std::fmt;

use serde_json::{Map, Value};

use super::{Keyframe, Timeline};
use crate::{error::ParseError, Channel};

/// Frame period used when a `frames` entry carries no timestamp (60 Hz).
pub const FRAME_PERIOD_MS: f64 = 1000.0 / 60.0;

const FRAME_TIME_KEYS: [&str; 3] = ["timestamp_ms", "time", "t_ms"];

#[derive(Debug, Clone, Copy)]
enum Shape {
    Timeline,
    Keyframes,
    Frames,
    TopLevel,
}

impl Shape {
    const PRIORITY: [Shape; 4] = [Shape::Timeline, Shape::Keyframes, Shape::Frames, Shape::TopLevel];

    fn parse(self, root: &Map<String, Value>, out: &mut Tracks) -> Result<Option<String>, ParseError> {
        match self {
            Self::Timeline => parse_timeline(root, out),
            Self::Keyframes => parse_keyframes(root, out),
            Self::Frames => parse_frames(root, out),
            Self::TopLevel => parse_top_level(root, out),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeline => "timeline",
            Self::Keyframes => "keyframes",
            Self::Frames => "frames",
            Self::TopLevel => "top-level channels",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Unit {
    Degrees,
    /// 0..=100 across the mechanical range.
    Percent,
    /// Signed degrees around the neutral angle.
    Yaw,
}

const FIELD_ALIASES: [(&str, Channel, Unit); 15] = [
    ("jaw", Channel::Jaw, Unit::Degrees),
    ("jaw_deg", Channel::Jaw, Unit::Degrees),
    ("jawOpening", Channel::Jaw, Unit::Percent),
    ("eye_left", Channel::EyeLeft, Unit::Degrees),
    ("eye_left_deg", Channel::EyeLeft, Unit::Degrees),
    ("eyeLeftYaw", Channel::EyeLeft, Unit::Yaw),
    ("eye_right", Channel::EyeRight, Unit::Degrees),
    ("eye_right_deg", Channel::EyeRight, Unit::Degrees),
    ("eyeRightYaw", Channel::EyeRight, Unit::Yaw),
    ("neck_pan", Channel::NeckPan, Unit::Degrees),
    ("neck_pan_deg", Channel::NeckPan, Unit::Degrees),
    ("neckYaw", Channel::NeckPan, Unit::Yaw),
    ("neck", Channel::NeckPan, Unit::Degrees),
    ("neck_deg", Channel::NeckPan, Unit::Degrees),
    ("neckPan", Channel::NeckPan, Unit::Degrees),
];

fn resolve_field(name: &str) -> Option<(Channel, Unit)> {
    FIELD_ALIASES
        .iter()
        .find(|(alias, _, _)| *alias == name)
        .map(|(_, channel, unit)| (*channel, *unit))
}

fn to_degrees(channel: Channel, unit: Unit, value: f64) -> f64 {
    let spec = channel.spec();
    match unit {
        Unit::Degrees => value,
        Unit::Percent => spec.angle_from_percent(value),
        Unit::Yaw => spec.neutral_angle + value,
    }
}

#[derive(Debug, Default)]
struct Tracks(Vec<(Channel, Vec<Keyframe>)>);

impl Tracks {
    fn push(&mut self, channel: Channel, unit: Unit, time_ms: u64, value: f64) {
        let keyframe = Keyframe::new(time_ms, to_degrees(channel, unit, value));
        match self.0.iter_mut().find(|(existing, _)| *existing == channel) {
            Some((_, keyframes)) => keyframes.push(keyframe),
            None => self.0.push((channel, vec![keyframe])),
        }
    }
}

pub(super) fn load(raw: &[u8]) -> Result<Timeline, ParseError> {
    let document: Value = serde_json::from_slice(raw)?;
    let Value::Object(root) = &document else {
        return Err(ParseError::UnsupportedSchema {
            attempts: vec![format!("root must be a JSON object, found {}", kind(&document))],
        });
    };

    let mut attempts = Vec::new();
    for shape in Shape::PRIORITY {
        let mut tracks = Tracks::default();
        match shape.parse(root, &mut tracks)? {
            None => {
                let timeline = Timeline::from_tracks(tracks.0, 0);
                let duration_ms = metadata_duration(root).unwrap_or_else(|| timeline.last_keyframe_ms());
                tracing::debug!(%shape, duration_ms, "timeline shape matched");
                return Ok(Timeline {
                    duration_ms,
                    ..timeline
                });
            }
            Some(reason) => attempts.push(format!("{shape}: {reason}")),
        }
    }

    Err(ParseError::UnsupportedSchema { attempts })
}

fn metadata_duration(root: &Map<String, Value>) -> Option<u64> {
    let duration = root.get("metadata")?.get("duration")?.as_f64()?;
    (duration.is_finite() && duration > 0.0).then(|| duration.round() as u64)
}

// `{ "timeline": [ { "time": ms, "motors": { field: value } } ] }`
fn parse_timeline(root: &Map<String, Value>, out: &mut Tracks) -> Result<Option<String>, ParseError> {
    let Some(entries) = root.get("timeline") else {
        return Ok(Some("no `timeline` key".into()));
    };
    let Value::Array(entries) = entries else {
        return Ok(Some(format!("`timeline` is {}, not an array", kind(entries))));
    };

    for (index, entry) in entries.iter().enumerate() {
        let location = format!("timeline[{index}]");
        let entry = as_object(entry, &location)?;
        let time_ms = required_time(entry, "time", &location)?;
        let motors = match entry.get("motors") {
            Some(Value::Object(motors)) => motors,
            Some(other) => {
                return Err(ParseError::malformed(
                    location,
                    format!("`motors` is {}, not an object", kind(other)),
                ))
            }
            None => return Err(ParseError::malformed(location, "missing `motors`")),
        };
        for (name, value) in motors {
            if let Some((channel, unit)) = resolve_field(name) {
                let value = number(value, &format!("{location}.motors.{name}"))?;
                out.push(channel, unit, time_ms, value);
            }
        }
    }
    Ok(None)
}

// `{ "keyframes": { field: [ {"time", "value"} ] }, "metadata": {...} }`
fn parse_keyframes(root: &Map<String, Value>, out: &mut Tracks) -> Result<Option<String>, ParseError> {
    match root.get("keyframes") {
        Some(Value::Object(tracks)) => {
            parse_track_map(tracks.iter(), "keyframes", out)?;
            Ok(None)
        }
        Some(other) => Ok(Some(format!("`keyframes` is {}, not an object", kind(other)))),
        None => Ok(Some("no `keyframes` key".into())),
    }
}

// `{ "frames": [ { "timestamp_ms": ms, field: value, ... } ] }`
fn parse_frames(root: &Map<String, Value>, out: &mut Tracks) -> Result<Option<String>, ParseError> {
    let Some(frames) = root.get("frames") else {
        return Ok(Some("no `frames` key".into()));
    };
    let Value::Array(frames) = frames else {
        return Ok(Some(format!("`frames` is {}, not an array", kind(frames))));
    };

    for (index, frame) in frames.iter().enumerate() {
        let location = format!("frames[{index}]");
        let frame = as_object(frame, &location)?;
        let explicit = FRAME_TIME_KEYS
            .iter()
            .find_map(|key| frame.get(*key).map(|value| (*key, value)));
        let time_ms = match explicit {
            Some((key, value)) => time(value, &format!("{location}.{key}"))?,
            None => (index as f64 * FRAME_PERIOD_MS).round() as u64,
        };
        for (name, value) in frame {
            if let Some((channel, unit)) = resolve_field(name) {
                let value = number(value, &format!("{location}.{name}"))?;
                out.push(channel, unit, time_ms, value);
            }
        }
    }
    Ok(None)
}

// `{ "jaw_deg": [ {"time", "value"} ], ... }`
fn parse_top_level(root: &Map<String, Value>, out: &mut Tracks) -> Result<Option<String>, ParseError> {
    let tracks: Vec<(&String, &Value)> = root
        .iter()
        .filter(|(name, value)| resolve_field(name).is_some() && value.is_array())
        .collect();
    if tracks.is_empty() {
        return Ok(Some("no channel arrays at the top level".into()));
    }
    parse_track_map(tracks.into_iter(), "", out)?;
    Ok(None)
}

fn parse_track_map<'a>(
    tracks: impl Iterator<Item = (&'a String, &'a Value)>,
    prefix: &str,
    out: &mut Tracks,
) -> Result<(), ParseError> {
    for (name, track) in tracks {
        let Some((channel, unit)) = resolve_field(name) else {
            continue;
        };
        let location = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        let Value::Array(keyframes) = track else {
            return Err(ParseError::malformed(
                location,
                format!("track is {}, not an array", kind(track)),
            ));
        };
        for (index, keyframe) in keyframes.iter().enumerate() {
            let location = format!("{location}[{index}]");
            let keyframe = as_object(keyframe, &location)?;
            let time_ms = required_time(keyframe, "time", &location)?;
            let value = match keyframe.get("value") {
                Some(value) => number(value, &format!("{location}.value"))?,
                None => return Err(ParseError::malformed(location, "missing `value`")),
            };
            out.push(channel, unit, time_ms, value);
        }
    }
    Ok(())
}

fn as_object<'a>(value: &'a Value, location: &str) -> Result<&'a Map<String, Value>, ParseError> {
    value
        .as_object()
        .ok_or_else(|| ParseError::malformed(location, format!("expected an object, found {}", kind(value))))
}

fn required_time(entry: &Map<String, Value>, key: &str, location: &str) -> Result<u64, ParseError> {
    match entry.get(key) {
        Some(value) => time(value, &format!("{location}.{key}")),
        None => Err(ParseError::malformed(location, format!("missing `{key}`"))),
    }
}

fn number(value: &Value, location: &str) -> Result<f64, ParseError> {
    match value.as_f64() {
        Some(number) if number.is_finite() => Ok(number),
        _ => Err(ParseError::malformed(
            location,
            format!("expected a number, found {}", kind(value)),
        )),
    }
}

fn time(value: &Value, location: &str) -> Result<u64, ParseError> {
    let ms = number(value, location)?;
    if ms < 0.0 {
        return Err(ParseError::malformed(location, format!("negative time {ms}")));
    }
    Ok(ms.round() as u64)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jaw_values(timeline: &Timeline) -> Vec<(u64, f64)> {
        timeline
            .keyframes(Channel::Jaw)
            .unwrap()
            .iter()
            .map(|k| (k.time_ms, k.value_degrees))
            .collect()
    }

    #[test]
    fn all_shapes_produce_the_same_timeline() {
        let timeline = r#"{"timeline": [
            {"time": 0, "motors": {"jaw_deg": 120, "neck_pan_deg": 90}},
            {"time": 500, "motors": {"jaw_deg": 150, "neck_pan_deg": 100}}
        ]}"#;
        let keyframes = r#"{"keyframes": {
            "jaw_deg": [{"time": 0, "value": 120}, {"time": 500, "value": 150}],
            "neck_pan_deg": [{"time": 0, "value": 90}, {"time": 500, "value": 100}]
        }, "metadata": {"duration": 500}}"#;
        let frames = r#"{"frames": [
            {"timestamp_ms": 0, "jaw_deg": 120, "neck_pan_deg": 90},
            {"timestamp_ms": 500, "jaw_deg": 150, "neck_pan_deg": 100}
        ]}"#;
        let top_level = r#"{
            "jaw_deg": [{"time": 0, "value": 120}, {"time": 500, "value": 150}],
            "neck_pan_deg": [{"time": 0, "value": 90}, {"time": 500, "value": 100}]
        }"#;

        let expected = Timeline::load(timeline.as_bytes()).unwrap();
        assert_eq!(expected.duration_ms(), 500);
        assert_eq!(jaw_values(&expected), vec![(0, 120.0), (500, 150.0)]);
        for raw in [keyframes, frames, top_level] {
            assert_eq!(Timeline::load(raw.as_bytes()).unwrap(), expected);
        }
    }

    #[test]
    fn jaw_opening_percent_spans_mechanical_range() {
        let raw = r#"{"frames": [
            {"timestamp_ms": 0, "jawOpening": 0},
            {"timestamp_ms": 100, "jawOpening": 100}
        ]}"#;
        let timeline = Timeline::load(raw.as_bytes()).unwrap();
        let spec = Channel::Jaw.spec();
        assert_eq!(
            jaw_values(&timeline),
            vec![(0, spec.min_angle), (100, spec.max_angle)]
        );
    }

    #[test]
    fn yaw_fields_are_relative_to_neutral() {
        let raw = r#"{"timeline": [{"time": 0, "motors": {"neckYaw": -30, "eyeLeftYaw": 12}}]}"#;
        let timeline = Timeline::load(raw.as_bytes()).unwrap();
        assert_eq!(timeline.keyframes(Channel::NeckPan).unwrap()[0].value_degrees, 60.0);
        assert_eq!(timeline.keyframes(Channel::EyeLeft).unwrap()[0].value_degrees, 102.0);
    }

    #[test]
    fn frames_without_timestamps_use_index_timing() {
        let raw = r#"{"frames": [{"jaw_deg": 120}, {"jaw_deg": 121}, {"jaw_deg": 122}]}"#;
        let timeline = Timeline::load(raw.as_bytes()).unwrap();
        let times: Vec<u64> = jaw_values(&timeline).into_iter().map(|(t, _)| t).collect();
        assert_eq!(times, vec![0, 17, 33]);
    }

    #[test]
    fn unknown_channels_are_ignored() {
        let raw = r#"{"keyframes": {
            "tail_deg": [{"time": 0, "value": "wag"}],
            "jaw_deg": [{"time": 0, "value": 130}]
        }}"#;
        let timeline = Timeline::load(raw.as_bytes()).unwrap();
        assert_eq!(timeline.channels().collect::<Vec<_>>(), vec![Channel::Jaw]);
    }

    #[test]
    fn out_of_order_and_duplicate_keyframes_are_normalised() {
        let raw = r#"{"jaw_deg": [
            {"time": 300, "value": 3},
            {"time": 100, "value": 1},
            {"time": 300, "value": 4}
        ]}"#;
        let timeline = Timeline::load(raw.as_bytes()).unwrap();
        assert_eq!(jaw_values(&timeline), vec![(100, 1.0), (300, 4.0)]);
        assert_eq!(timeline.duration_ms(), 300);
    }

    #[test]
    fn unrecognised_document_lists_every_attempt() {
        let err = Timeline::load(br#"{"tracks": []}"#).unwrap_err();
        match err {
            ParseError::UnsupportedSchema { attempts } => assert_eq!(attempts.len(), 4),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            Timeline::load(b"[1, 2]").unwrap_err(),
            ParseError::UnsupportedSchema { .. }
        ));
    }

    #[test]
    fn non_numeric_values_are_malformed() {
        let raw = r#"{"timeline": [{"time": 0, "motors": {"jaw_deg": "open"}}]}"#;
        let err = Timeline::load(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedKeyframe { .. }));

        let raw = r#"{"keyframes": {"jaw_deg": [{"value": 120}]}}"#;
        let err = Timeline::load(raw.as_bytes()).unwrap_err();
        assert!(format!("{err}").contains("missing `time`"));
    }

    #[test]
    fn matched_shape_does_not_fall_through() {
        // `timeline` matches structurally, so the bad entry is reported even
        // though a valid top-level track exists as well.
        let raw = r#"{"timeline": [{"motors": {}}], "jaw_deg": [{"time": 0, "value": 1}]}"#;
        assert!(matches!(
            Timeline::load(raw.as_bytes()).unwrap_err(),
            ParseError::MalformedKeyframe { .. }
        ));
    }

    #[test]
    fn invalid_json_is_reported() {
        assert!(matches!(
            Timeline::load(b"{not json").unwrap_err(),
            ParseError::InvalidJson(_)
        ));
    }
}
