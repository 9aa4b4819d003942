use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// One independently controlled actuator axis of the skull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Jaw,
    EyeLeft,
    EyeRight,
    NeckPan,
}

impl Channel {
    /// Every channel, in the order the control loop writes them.
    pub const ALL: [Channel; 4] = [
        Channel::Jaw,
        Channel::EyeLeft,
        Channel::EyeRight,
        Channel::NeckPan,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jaw => "jaw",
            Self::EyeLeft => "eye_left",
            Self::EyeRight => "eye_right",
            Self::NeckPan => "neck_pan",
        }
    }

    /// Position of the channel in [`Channel::ALL`], handy for fixed arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Mechanical limits of the channel on the compiled-in device model.
    pub fn spec(self) -> &'static ChannelSpec {
        &SKULL_V1[self.index()]
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jaw" => Ok(Self::Jaw),
            "eye_left" => Ok(Self::EyeLeft),
            "eye_right" => Ok(Self::EyeRight),
            "neck_pan" | "neck" => Ok(Self::NeckPan),
            other => Err(format!("unknown channel `{other}`")),
        }
    }
}

/// Immutable mechanical description of one servo.
///
/// `pulse_min`/`pulse_max` are the PWM pulse widths (microseconds) that
/// correspond to `min_angle`/`max_angle`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSpec {
    pub channel: Channel,
    /// Output index on the PWM controller.
    pub bus_output: u8,
    pub min_angle: f64,
    pub max_angle: f64,
    pub neutral_angle: f64,
    pub pulse_min: f64,
    pub pulse_max: f64,
}

impl ChannelSpec {
    pub fn clamp(&self, degrees: f64) -> f64 {
        degrees.clamp(self.min_angle, self.max_angle)
    }

    /// Linear map from an in-range angle to its pulse width.
    pub fn pulse_for(&self, degrees: f64) -> f64 {
        let span = self.max_angle - self.min_angle;
        if span <= f64::EPSILON {
            return self.pulse_min;
        }
        let ratio = (self.clamp(degrees) - self.min_angle) / span;
        self.pulse_min + ratio * (self.pulse_max - self.pulse_min)
    }

    /// Maps a 0..=100 percentage onto the mechanical range.
    pub fn angle_from_percent(&self, pct: f64) -> f64 {
        self.min_angle + (pct / 100.0) * (self.max_angle - self.min_angle)
    }
}

// Servos are driven at 500 us for 0 deg and 2500 us for 180 deg; the pulse
// bounds below are that line evaluated at each channel's mechanical limits.
const SKULL_V1: [ChannelSpec; 4] = [
    ChannelSpec {
        channel: Channel::Jaw,
        bus_output: 0,
        min_angle: 110.0,
        max_angle: 185.0,
        neutral_angle: 180.0,
        pulse_min: 1722.2,
        pulse_max: 2555.6,
    },
    ChannelSpec {
        channel: Channel::EyeLeft,
        bus_output: 1,
        min_angle: 60.0,
        max_angle: 120.0,
        neutral_angle: 90.0,
        pulse_min: 1166.7,
        pulse_max: 1833.3,
    },
    ChannelSpec {
        channel: Channel::EyeRight,
        bus_output: 2,
        min_angle: 60.0,
        max_angle: 120.0,
        neutral_angle: 90.0,
        pulse_min: 1166.7,
        pulse_max: 1833.3,
    },
    ChannelSpec {
        channel: Channel::NeckPan,
        bus_output: 3,
        min_angle: 0.0,
        max_angle: 180.0,
        neutral_angle: 90.0,
        pulse_min: 500.0,
        pulse_max: 2500.0,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_are_indexed_by_channel() {
        for channel in Channel::ALL {
            assert_eq!(channel.spec().channel, channel);
            let spec = channel.spec();
            assert!(spec.min_angle <= spec.neutral_angle && spec.neutral_angle <= spec.max_angle);
        }
    }

    #[test]
    fn pulse_tracks_angle_linearly() {
        let neck = Channel::NeckPan.spec();
        assert_eq!(neck.pulse_for(0.0), 500.0);
        assert_eq!(neck.pulse_for(90.0), 1500.0);
        assert_eq!(neck.pulse_for(180.0), 2500.0);
        assert_eq!(neck.pulse_for(400.0), 2500.0);
    }

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("eye_right".parse::<Channel>().unwrap(), Channel::EyeRight);
        assert_eq!("neck".parse::<Channel>().unwrap(), Channel::NeckPan);
        assert!("tail".parse::<Channel>().is_err());
    }
}
