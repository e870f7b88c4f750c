use ndarray::{Array1, Zip};

use super::frame::SignalFrame;
use super::Thresholds;

/// Keep `delta` where `gate >= threshold`, zero elsewhere.
///
/// A closed gate yields zero even when the delta itself is missing.
pub fn gate_signal(delta: &Array1<f64>, gate: &Array1<f64>, threshold: f64) -> Array1<f64> {
    Zip::from(delta)
        .and(gate)
        .map_collect(|&d, &g| if g >= threshold { d } else { 0.0 })
}

/// Split `distance_delta` into the high-speed and acceleration-load sub-signals.
pub fn build_derived_signals(mut frame: SignalFrame, thresholds: &Thresholds) -> SignalFrame {
    frame.distance_delta_hsr = gate_signal(
        &frame.distance_delta,
        &frame.velocity,
        thresholds.hsr_velocity,
    );
    frame.distance_delta_accel = gate_signal(
        &frame.distance_delta,
        &frame.acceleration,
        thresholds.accel_load,
    );
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{frame_from, Sample};

    #[test]
    fn thresholds_are_inclusive() {
        let samples = vec![
            Sample::clean(0.0, 6.0, 0.0),
            Sample::clean(1.0, 5.0, 2.0),
            Sample::clean(2.0, 4.99, 1.99),
            Sample::clean(3.5, 8.0, 2.5),
        ];
        let frame = build_derived_signals(frame_from(&samples), &Thresholds::default());
        assert_eq!(frame.distance_delta_hsr.to_vec()[1..], [1.0, 0.0, 1.5]);
        assert_eq!(frame.distance_delta_accel.to_vec()[1..], [1.0, 0.0, 1.5]);
    }

    #[test]
    fn missing_delta_only_survives_an_open_gate() {
        let delta = Array1::from_vec(vec![f64::NAN, f64::NAN, 0.4]);
        let velocity = Array1::from_vec(vec![6.0, 1.0, 6.0]);
        let gated = gate_signal(&delta, &velocity, 5.0);
        assert!(gated[0].is_nan());
        assert_eq!(gated[1], 0.0);
        assert_eq!(gated[2], 0.4);
    }

    #[test]
    fn custom_thresholds_are_honoured() {
        let samples = vec![Sample::clean(0.0, 3.0, 1.0), Sample::clean(1.0, 3.0, 1.0)];
        let thresholds = Thresholds {
            hsr_velocity: 2.5,
            accel_load: 0.5,
            ..Thresholds::default()
        };
        let frame = build_derived_signals(frame_from(&samples), &thresholds);
        assert_eq!(frame.distance_delta_hsr[1], 1.0);
        assert_eq!(frame.distance_delta_accel[1], 1.0);
    }
}
