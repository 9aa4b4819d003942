//! Externally supplied gaze target and the policy for letting it steer the
//! eyes and neck.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use crate::Channel;

/// Default freshness window for a received pose.
pub const DEFAULT_STALENESS: Duration = Duration::from_millis(500);

/// Pan/tilt target, in degrees from straight ahead, and when it arrived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GazePose {
    pub pan_degrees: f64,
    pub tilt_degrees: f64,
    pub observed_at: Instant,
}

/// Latest-pose slot shared between an external writer (the network
/// listener) and the control loop. Clones share the slot.
#[derive(Debug, Clone)]
pub struct GazeChannel {
    slot: Arc<ArcSwapOption<GazePose>>,
    staleness: Duration,
}

impl Default for GazeChannel {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS)
    }
}

impl GazeChannel {
    pub fn new(staleness: Duration) -> Self {
        Self {
            slot: Arc::new(ArcSwapOption::empty()),
            staleness,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Records a pose observed now.
    pub fn publish(&self, pan_degrees: f64, tilt_degrees: f64) {
        self.publish_pose(GazePose {
            pan_degrees,
            tilt_degrees,
            observed_at: Instant::now(),
        });
    }

    pub fn publish_pose(&self, pose: GazePose) {
        self.slot.store(Some(Arc::new(pose)));
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }

    /// Most recent pose regardless of age.
    pub fn latest(&self) -> Option<GazePose> {
        self.slot.load().as_deref().copied()
    }

    /// Most recent pose if it is still inside the staleness window.
    pub fn current_pose(&self) -> Option<GazePose> {
        self.current_pose_at(Instant::now())
    }

    pub fn current_pose_at(&self, now: Instant) -> Option<GazePose> {
        self.latest()
            .filter(|pose| now.saturating_duration_since(pose.observed_at) <= self.staleness)
    }
}

/// Which channels a fresh pose overrides during playback and how a pose
/// maps to an angle. The jaw carries lip sync and is never overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct GazeOverride {
    pub enabled: bool,
    channels: Vec<Channel>,
    pub eye_gain: f64,
    pub neck_gain: f64,
}

impl Default for GazeOverride {
    fn default() -> Self {
        Self::new(
            false,
            [Channel::EyeLeft, Channel::EyeRight, Channel::NeckPan],
            1.0,
            1.0,
        )
    }
}

impl GazeOverride {
    pub fn new(
        enabled: bool,
        channels: impl IntoIterator<Item = Channel>,
        eye_gain: f64,
        neck_gain: f64,
    ) -> Self {
        let mut selected = Vec::new();
        for channel in channels {
            if channel == Channel::Jaw {
                tracing::warn!("jaw cannot follow gaze, ignoring it in the override set");
            } else if !selected.contains(&channel) {
                selected.push(channel);
            }
        }
        Self {
            enabled,
            channels: selected,
            eye_gain,
            neck_gain,
        }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn applies_to(&self, channel: Channel) -> bool {
        self.enabled && self.channels.contains(&channel)
    }

    pub fn angle_for(&self, channel: Channel, pose: &GazePose) -> f64 {
        let gain = match channel {
            Channel::NeckPan => self.neck_gain,
            _ => self.eye_gain,
        };
        channel.spec().neutral_angle + pose.pan_degrees * gain
    }

    /// Timeline value for `channel`, replaced by the gaze angle when the
    /// override applies and a fresh pose exists.
    pub fn resolve(&self, channel: Channel, timeline_value: f64, pose: Option<&GazePose>) -> f64 {
        match pose {
            Some(pose) if self.applies_to(channel) => self.angle_for(channel, pose),
            _ => timeline_value,
        }
    }
}

/// Proportional controller settings for one group of channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CenteringGains {
    pub kp: f64,
    pub deadzone_degrees: f64,
    pub max_speed_dps: f64,
}

impl CenteringGains {
    /// Describes the first unusable setting, if any.
    pub fn check(&self) -> std::result::Result<(), String> {
        if !self.kp.is_finite() {
            return Err(format!("kp must be finite, got {}", self.kp));
        }
        if !self.deadzone_degrees.is_finite() || self.deadzone_degrees < 0.0 {
            return Err(format!("deadzone_degrees must be >= 0, got {}", self.deadzone_degrees));
        }
        if !self.max_speed_dps.is_finite() || self.max_speed_dps < 0.0 {
            return Err(format!("max_speed_dps must be >= 0, got {}", self.max_speed_dps));
        }
        Ok(())
    }

    pub const NECK: Self = Self {
        kp: 0.3,
        deadzone_degrees: 3.0,
        max_speed_dps: 15.0,
    };
    pub const EYES: Self = Self {
        kp: 0.4,
        deadzone_degrees: 2.0,
        max_speed_dps: 60.0,
    };
}

/// Idle-time follower that turns toward the tracked person.
///
/// The pose pan is the person's offset from centre; each step moves the
/// target against that error, ignoring small errors and limiting speed.
#[derive(Debug, Clone)]
pub struct CenteringFollower {
    neck: CenteringGains,
    eyes: CenteringGains,
    targets: [f64; 4],
    last_step: Option<Instant>,
}

impl Default for CenteringFollower {
    fn default() -> Self {
        Self::new(CenteringGains::NECK, CenteringGains::EYES)
    }
}

impl CenteringFollower {
    pub fn new(neck: CenteringGains, eyes: CenteringGains) -> Self {
        Self {
            neck,
            eyes,
            targets: Channel::ALL.map(|channel| channel.spec().neutral_angle),
            last_step: None,
        }
    }

    /// Back to neutral targets.
    pub fn reset(&mut self) {
        *self = Self::new(self.neck, self.eyes);
    }

    /// No pose this tick; the next step starts a fresh time base.
    pub fn pause(&mut self) {
        self.last_step = None;
    }

    pub fn target(&self, channel: Channel) -> f64 {
        self.targets[channel.index()]
    }

    /// Returns the channels whose target moved, with their new angle.
    pub fn step(&mut self, pose: &GazePose, now: Instant, channels: &[Channel]) -> Vec<(Channel, f64)> {
        let dt = self
            .last_step
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
            .unwrap_or(0.0);
        self.last_step = Some(now);

        let mut moved = Vec::new();
        for &channel in channels {
            let gains = match channel {
                Channel::Jaw => continue,
                Channel::NeckPan => self.neck,
                Channel::EyeLeft | Channel::EyeRight => self.eyes,
            };
            let error = pose.pan_degrees;
            if error.abs() <= gains.deadzone_degrees || !error.is_finite() {
                continue;
            }
            let max_step = (gains.max_speed_dps * dt).abs();
            let correction = -error * gains.kp;
            if max_step.is_nan() || max_step == 0.0 || !correction.is_finite() || correction == 0.0 {
                continue;
            }
            let correction = correction.clamp(-max_step, max_step);
            let spec = channel.spec();
            let target = spec.clamp(self.targets[channel.index()] + correction);
            self.targets[channel.index()] = target;
            moved.push((channel, target));
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_at(pan: f64, observed_at: Instant) -> GazePose {
        GazePose {
            pan_degrees: pan,
            tilt_degrees: 0.0,
            observed_at,
        }
    }

    #[test]
    fn empty_channel_has_no_pose() {
        assert!(GazeChannel::default().current_pose().is_none());
    }

    #[test]
    fn stale_pose_is_absent() {
        let gaze = GazeChannel::new(Duration::from_millis(500));
        let start = Instant::now();
        gaze.publish_pose(pose_at(10.0, start));

        assert!(gaze.current_pose_at(start + Duration::from_millis(499)).is_some());
        assert!(gaze.current_pose_at(start + Duration::from_millis(501)).is_none());
        assert!(gaze.latest().is_some());
    }

    #[test]
    fn clones_share_the_slot() {
        let reader = GazeChannel::default();
        let writer = reader.clone();
        writer.publish(5.0, -2.0);
        assert_eq!(reader.current_pose().unwrap().pan_degrees, 5.0);
    }

    #[test]
    fn override_never_touches_the_jaw() {
        let policy = GazeOverride::new(true, Channel::ALL, 1.0, 1.0);
        let pose = pose_at(20.0, Instant::now());

        assert_eq!(policy.channels(), &[Channel::EyeLeft, Channel::EyeRight, Channel::NeckPan]);
        assert_eq!(policy.resolve(Channel::Jaw, 150.0, Some(&pose)), 150.0);
        assert_eq!(policy.resolve(Channel::NeckPan, 95.0, Some(&pose)), 110.0);
        assert_eq!(policy.resolve(Channel::NeckPan, 95.0, None), 95.0);
    }

    #[test]
    fn disabled_override_keeps_timeline_values() {
        let policy = GazeOverride::default();
        let pose = pose_at(20.0, Instant::now());
        assert_eq!(policy.resolve(Channel::EyeLeft, 80.0, Some(&pose)), 80.0);
    }

    #[test]
    fn follower_moves_against_error_with_speed_limit() {
        let mut follower = CenteringFollower::default();
        let start = Instant::now();
        let pose = pose_at(30.0, start);

        assert!(follower.step(&pose, start, &[Channel::NeckPan]).is_empty());

        let moved = follower.step(&pose, start + Duration::from_millis(100), &[Channel::NeckPan]);
        // -30 * 0.3 = -9, limited to 15 deg/s * 0.1 s.
        assert_eq!(moved.len(), 1);
        assert!((moved[0].1 - 88.5).abs() < 1e-9);
    }

    #[test]
    fn follower_ignores_errors_inside_deadzone() {
        let mut follower = CenteringFollower::default();
        let start = Instant::now();
        let pose = pose_at(1.5, start);
        follower.step(&pose, start, &[Channel::EyeLeft]);
        let moved = follower.step(&pose, start + Duration::from_secs(1), &[Channel::EyeLeft]);
        assert!(moved.is_empty());
        assert_eq!(follower.target(Channel::EyeLeft), 90.0);
    }

    #[test]
    fn negative_speed_limit_does_not_panic() {
        let gains = CenteringGains {
            max_speed_dps: -15.0,
            ..CenteringGains::NECK
        };
        assert!(gains.check().is_err());

        let mut follower = CenteringFollower::new(gains, CenteringGains::EYES);
        let start = Instant::now();
        let pose = pose_at(30.0, start);
        follower.step(&pose, start, &[Channel::NeckPan]);
        let moved = follower.step(&pose, start + Duration::from_millis(100), &[Channel::NeckPan]);

        assert_eq!(moved.len(), 1);
        assert!((moved[0].1 - 88.5).abs() < 1e-9);
    }
}
