use ndarray::Array1;
use serde::Serialize;
use tracing::debug;

use super::frame::{first_difference, SignalFrame};
use super::{DeltaOrder, Thresholds};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    /// Odometer samples discarded for poor positioning quality.
    pub invalidated: usize,
    /// Missing samples filled by interpolation.
    pub interpolated: usize,
    /// Missing samples left at the edges of the session.
    pub unresolved: usize,
}

fn is_suspect(hdop: f64, satellites: f64, velocity: f64, thresholds: &Thresholds) -> bool {
    hdop > thresholds.hdop_max
        || satellites <= thresholds.min_satellites
        || velocity > thresholds.velocity_ceiling
}

/// Fill interior NaN runs by linear interpolation between the bounding valid
/// samples. Leading and trailing runs are left as NaN. Returns the number of
/// samples filled.
pub fn interpolate_linear(values: &mut Array1<f64>) -> usize {
    let mut filled = 0;
    let mut last_valid: Option<usize> = None;
    for i in 0..values.len() {
        if values[i].is_nan() {
            continue;
        }
        if let Some(prev) = last_valid {
            let gap = i - prev;
            if gap > 1 {
                let (v0, v1) = (values[prev], values[i]);
                for j in prev + 1..i {
                    let frac = (j - prev) as f64 / gap as f64;
                    values[j] = v0 + (v1 - v0) * frac;
                }
                filled += gap - 1;
            }
        }
        last_valid = Some(i);
    }
    filled
}

/// Discard untrustworthy odometer samples and interpolate across the gaps.
///
/// With [`DeltaOrder::FilterFirst`] the distance delta is recomputed from the
/// cleaned odometer; with [`DeltaOrder::RawFirst`] the parse-time delta is kept.
pub fn apply_quality_filter(
    mut frame: SignalFrame,
    thresholds: &Thresholds,
    order: DeltaOrder,
) -> (SignalFrame, QualityReport) {
    let mut report = QualityReport::default();
    for i in 0..frame.len() {
        if is_suspect(
            frame.hdop[i],
            frame.num_satellites[i],
            frame.velocity[i],
            thresholds,
        ) {
            frame.odometer[i] = f64::NAN;
            report.invalidated += 1;
        }
    }

    report.interpolated = interpolate_linear(&mut frame.odometer);
    report.unresolved = frame.odometer.iter().filter(|v| v.is_nan()).count();

    if order == DeltaOrder::FilterFirst {
        frame.distance_delta = first_difference(&frame.odometer);
    }

    debug!(
        "quality filter: {} invalidated, {} interpolated, {} unresolved",
        report.invalidated, report.interpolated, report.unresolved
    );
    (frame, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{frame_from, steady_run, Sample};

    #[test]
    fn interior_gaps_are_linear() {
        let mut values = Array1::from_vec(vec![0.0, f64::NAN, f64::NAN, 3.0, 4.0]);
        assert_eq!(interpolate_linear(&mut values), 2);
        for (got, expected) in values.iter().zip([0.0, 1.0, 2.0, 3.0, 4.0]) {
            assert!((got - expected).abs() < 1e-9, "{:?}", values);
        }
    }

    #[test]
    fn edge_gaps_are_not_extrapolated() {
        let mut values = Array1::from_vec(vec![f64::NAN, 1.0, 2.0, f64::NAN]);
        assert_eq!(interpolate_linear(&mut values), 0);
        assert!(values[0].is_nan());
        assert!(values[3].is_nan());
    }

    #[test]
    fn low_satellite_fix_is_replaced_between_neighbours() {
        let mut samples = steady_run(10, 1.0, 4.0, 0.0);
        samples[5].odometer = 999.0;
        samples[5].satellites = 4.0;
        let (frame, report) = apply_quality_filter(
            frame_from(&samples),
            &Thresholds::default(),
            DeltaOrder::FilterFirst,
        );
        assert_eq!(report.invalidated, 1);
        let cleaned = frame.odometer[5];
        assert!(cleaned > frame.odometer[4] && cleaned < frame.odometer[6]);
        assert!((frame.distance_delta[6] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn flagged_samples_never_keep_raw_values() {
        let mut samples = steady_run(8, 1.0, 4.0, 0.0);
        samples[2] = Sample {
            hdop: 2.5,
            odometer: 50.0,
            ..samples[2]
        };
        samples[4] = Sample {
            velocity: 12.0,
            odometer: 80.0,
            ..samples[4]
        };
        samples[5].satellites = 6.0;
        samples[5].odometer = 90.0;
        let (frame, report) = apply_quality_filter(
            frame_from(&samples),
            &Thresholds::default(),
            DeltaOrder::FilterFirst,
        );
        assert_eq!(report.invalidated, 3);
        assert_eq!(report.unresolved, 0);
        for (i, expected) in [(2, 2.0), (4, 4.0), (5, 5.0)] {
            assert!((frame.odometer[i] - expected).abs() < 1e-9, "row {}", i);
        }
    }

    #[test]
    fn trailing_flags_remain_unresolved() {
        let mut samples = steady_run(5, 1.0, 4.0, 0.0);
        samples[4].hdop = 9.0;
        let (frame, report) = apply_quality_filter(
            frame_from(&samples),
            &Thresholds::default(),
            DeltaOrder::FilterFirst,
        );
        assert_eq!(report.unresolved, 1);
        assert!(frame.odometer[4].is_nan());
        assert!(frame.distance_delta[4].is_nan());
    }

    #[test]
    fn raw_first_keeps_parse_time_delta() {
        let mut samples = steady_run(6, 1.0, 4.0, 0.0);
        samples[3].odometer = 40.0;
        samples[3].hdop = 5.0;
        let (frame, _) = apply_quality_filter(
            frame_from(&samples),
            &Thresholds::default(),
            DeltaOrder::RawFirst,
        );
        assert_eq!(frame.odometer[3], 3.0);
        assert_eq!(frame.distance_delta[3], 38.0);
    }
}
