//! Angle to pulse conversion and the single write path to the servo bus.

use std::{
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::{calibration::Calibration, error::HardwareWriteError, Channel};

/// A PWM controller able to hold a pulse width on a numbered output.
///
/// Implementations talk to the physical controller (for the skull, a
/// PCA9685 on I2C). Only [`HardwareActuator`] calls into the bus.
pub trait PwmBus: Send {
    fn set_pulse(&mut self, output: u8, pulse_us: f64) -> io::Result<()>;
}

/// One pulse written to a [`SimulatedBus`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusWrite {
    pub output: u8,
    pub pulse_us: f64,
}

/// Bus that records writes instead of driving hardware. Clones share the
/// same log, so a handle kept by a test sees what the actuator wrote.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    log: Arc<Mutex<Vec<BusWrite>>>,
    failures: Arc<AtomicU32>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with an I/O error.
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<BusWrite> {
        self.log.lock().clone()
    }

    pub fn writes_to(&self, output: u8) -> Vec<f64> {
        self.log
            .lock()
            .iter()
            .filter(|write| write.output == output)
            .map(|write| write.pulse_us)
            .collect()
    }

    pub fn last_pulse(&self, output: u8) -> Option<f64> {
        self.writes_to(output).last().copied()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl PwmBus for SimulatedBus {
    fn set_pulse(&mut self, output: u8, pulse_us: f64) -> io::Result<()> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "simulated bus fault"));
        }
        tracing::trace!(output, pulse_us, "simulated pulse");
        self.log.lock().push(BusWrite { output, pulse_us });
        Ok(())
    }
}

/// Bounded retry for bus writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Delay before the second attempt; later attempts wait proportionally
    /// longer.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(2),
        }
    }
}

/// What the actuator actually sent for one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorCommand {
    pub channel: Channel,
    /// Angle asked for, before calibration.
    pub requested_angle: f64,
    /// Angle after offset and clamp; this is what the servo is driven to.
    pub calibrated_angle: f64,
    pub pulse_us: f64,
}

/// Owns the bus handle and the calibration snapshot.
pub struct HardwareActuator {
    bus: Box<dyn PwmBus>,
    calibration: Arc<Calibration>,
    retry: RetryPolicy,
    last: [Option<ActuatorCommand>; 4],
}

impl HardwareActuator {
    pub fn new(bus: impl PwmBus + 'static, calibration: Calibration) -> Self {
        Self {
            bus: Box::new(bus),
            calibration: Arc::new(calibration),
            retry: RetryPolicy::default(),
            last: [None; 4],
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            ..retry
        };
        self
    }

    /// Offset then clamp. Non-finite input falls back to neutral.
    pub fn calibrated_angle(&self, channel: Channel, angle_degrees: f64) -> f64 {
        let spec = channel.spec();
        let target = angle_degrees + self.calibration.offset(channel);
        if target.is_finite() {
            spec.clamp(target)
        } else {
            spec.clamp(spec.neutral_angle + self.calibration.offset(channel))
        }
    }

    /// Drives `channel` to `angle_degrees`. A disabled channel is skipped
    /// and keeps its last pulse; `Ok(None)` reports the skip.
    pub fn write(
        &mut self,
        channel: Channel,
        angle_degrees: f64,
    ) -> Result<Option<ActuatorCommand>, HardwareWriteError> {
        if !self.calibration.is_enabled(channel) {
            return Ok(None);
        }

        let spec = channel.spec();
        let calibrated_angle = self.calibrated_angle(channel, angle_degrees);
        let pulse_us = spec.pulse_for(calibrated_angle);
        self.send(channel, spec.bus_output, pulse_us)?;

        let command = ActuatorCommand {
            channel,
            requested_angle: angle_degrees,
            calibrated_angle,
            pulse_us,
        };
        self.last[channel.index()] = Some(command);
        Ok(Some(command))
    }

    fn send(&mut self, channel: Channel, output: u8, pulse_us: f64) -> Result<(), HardwareWriteError> {
        let mut attempt = 1;
        loop {
            match self.bus.set_pulse(output, pulse_us) {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= self.retry.attempts => {
                    return Err(HardwareWriteError {
                        channel,
                        attempts: attempt,
                        source,
                    })
                }
                Err(err) => {
                    tracing::warn!(%channel, attempt, error = %err, "bus write failed, retrying");
                    thread::sleep(self.retry.backoff * attempt);
                    attempt += 1;
                }
            }
        }
    }

    /// Drives every enabled channel to its neutral angle. All channels are
    /// attempted even if one fails; the first failure is returned.
    pub fn neutral(
        &mut self,
        mut on_command: impl FnMut(&ActuatorCommand),
    ) -> Result<(), HardwareWriteError> {
        let mut first_error = None;
        for channel in Channel::ALL {
            match self.write(channel, channel.spec().neutral_angle) {
                Ok(Some(command)) => on_command(&command),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(error = %err, "failed to park channel at neutral");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn disable(&mut self, channel: Channel) {
        self.set_enabled(channel, false);
    }

    pub fn set_enabled(&mut self, channel: Channel, enabled: bool) {
        if self.calibration.is_enabled(channel) != enabled {
            tracing::info!(%channel, enabled, "channel enable changed");
            let next = self.calibration.with_enabled(channel, enabled);
            self.calibration = Arc::new(next);
        }
    }

    pub fn set_offset(&mut self, channel: Channel, degrees: f64) {
        let next = self.calibration.with_offset(channel, degrees);
        tracing::info!(%channel, offset = next.offset(channel), "calibration offset changed");
        self.calibration = Arc::new(next);
    }

    /// Swaps in a new calibration snapshot.
    pub fn reload_calibration(&mut self, calibration: Calibration) {
        self.calibration = Arc::new(calibration);
    }

    pub fn calibration(&self) -> Arc<Calibration> {
        Arc::clone(&self.calibration)
    }

    pub fn last_command(&self, channel: Channel) -> Option<ActuatorCommand> {
        self.last[channel.index()]
    }
}

impl std::fmt::Debug for HardwareActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareActuator")
            .field("calibration", &self.calibration)
            .field("retry", &self.retry)
            .field("last", &self.last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn actuator(calibration: Calibration) -> (HardwareActuator, SimulatedBus) {
        let bus = SimulatedBus::new();
        let actuator = HardwareActuator::new(bus.clone(), calibration).with_retry(RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        });
        (actuator, bus)
    }

    #[test]
    fn applies_offset_before_clamping() {
        let calibration = Calibration::default().with_offset(Channel::EyeLeft, -14.0);
        let (mut actuator, bus) = actuator(calibration);

        let command = actuator.write(Channel::EyeLeft, 90.0).unwrap().unwrap();
        assert_eq!(command.calibrated_angle, 76.0);

        let command = actuator.write(Channel::EyeLeft, 65.0).unwrap().unwrap();
        assert_eq!(command.calibrated_angle, 60.0);
        assert_eq!(command.pulse_us, Channel::EyeLeft.spec().pulse_min);
        assert_eq!(bus.writes_to(1).len(), 2);
    }

    #[test]
    fn disabled_channel_is_not_written() {
        let (mut actuator, bus) = actuator(Calibration::default());
        actuator.write(Channel::EyeLeft, 100.0).unwrap();
        actuator.disable(Channel::EyeLeft);

        assert_eq!(actuator.write(Channel::EyeLeft, 70.0).unwrap(), None);
        assert_eq!(bus.writes_to(1).len(), 1);
        assert_eq!(actuator.last_command(Channel::EyeLeft).unwrap().calibrated_angle, 100.0);
    }

    #[test]
    fn transient_faults_are_retried() {
        let (mut actuator, bus) = actuator(Calibration::default());
        bus.inject_failures(2);

        assert!(actuator.write(Channel::Jaw, 150.0).unwrap().is_some());
        assert_eq!(bus.writes().len(), 1);
    }

    #[test]
    fn persistent_fault_surfaces_after_bounded_attempts() {
        let (mut actuator, bus) = actuator(Calibration::default());
        bus.inject_failures(10);

        let err = actuator.write(Channel::NeckPan, 90.0).unwrap_err();
        assert_eq!(err.channel, Channel::NeckPan);
        assert_eq!(err.attempts, 3);
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn neutral_parks_enabled_channels_only() {
        let calibration = Calibration::default().with_enabled(Channel::Jaw, false);
        let (mut actuator, bus) = actuator(calibration);

        let mut parked = Vec::new();
        actuator.neutral(|command| parked.push(command.channel)).unwrap();

        assert_eq!(parked, vec![Channel::EyeLeft, Channel::EyeRight, Channel::NeckPan]);
        assert!(bus.writes_to(Channel::Jaw.spec().bus_output).is_empty());
        assert_eq!(bus.last_pulse(3), Some(1500.0));
    }

    #[test]
    fn non_finite_angles_fall_back_to_neutral() {
        let (actuator, _) = actuator(Calibration::default());
        assert_eq!(actuator.calibrated_angle(Channel::NeckPan, f64::NAN), 90.0);
    }

    proptest! {
        #[test]
        fn calibrated_angle_stays_in_mechanical_range(
            channel_index in 0usize..4,
            offset in -45.0f64..=45.0,
            angle in -1000.0f64..1000.0,
        ) {
            let channel = Channel::ALL[channel_index];
            let (mut actuator, _) = actuator(Calibration::default().with_offset(channel, offset));
            let spec = channel.spec();

            let command = actuator.write(channel, angle).unwrap().unwrap();
            prop_assert!(command.calibrated_angle >= spec.min_angle);
            prop_assert!(command.calibrated_angle <= spec.max_angle);
            prop_assert!(command.pulse_us >= spec.pulse_min.min(spec.pulse_max));
            prop_assert!(command.pulse_us <= spec.pulse_max.max(spec.pulse_min));
        }
    }
}
