use crate::{timeline::Keyframe, Channel, Timeline};

/// Instantaneous value (degrees, before calibration) of `channel` at
/// `elapsed_ms`.
///
/// Before the first keyframe the first value is held and after the last one
/// the last value is held; nothing is extrapolated. A channel with no
/// keyframes sits at its neutral angle.
pub fn value_at(timeline: &Timeline, channel: Channel, elapsed_ms: u64) -> f64 {
    match timeline.keyframes(channel) {
        Some(keyframes) => sample(keyframes, elapsed_ms).unwrap_or(channel.spec().neutral_angle),
        None => channel.spec().neutral_angle,
    }
}

/// Interpolates within a time-sorted keyframe slice. `None` only for an
/// empty slice.
pub fn sample(keyframes: &[Keyframe], elapsed_ms: u64) -> Option<f64> {
    let first = keyframes.first()?;
    let last = keyframes.last()?;
    if elapsed_ms <= first.time_ms {
        return Some(first.value_degrees);
    }
    if elapsed_ms >= last.time_ms {
        return Some(last.value_degrees);
    }

    match keyframes.binary_search_by_key(&elapsed_ms, |keyframe| keyframe.time_ms) {
        Ok(index) => Some(keyframes[index].value_degrees),
        // `index` is in 1..len because of the boundary checks above.
        Err(index) => {
            let (k0, k1) = (keyframes[index - 1], keyframes[index]);
            let span = (k1.time_ms - k0.time_ms) as f64;
            let alpha = (elapsed_ms - k0.time_ms) as f64 / span;
            Some(k0.value_degrees + (k1.value_degrees - k0.value_degrees) * alpha)
        }
    }
}
