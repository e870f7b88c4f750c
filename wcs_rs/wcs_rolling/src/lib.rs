//! Rolling-window workload metrics for GPS player-tracking exports.
//!
//! One export flows through [`parse_export`] → [`apply_quality_filter`] →
//! [`build_derived_signals`] → [`aggregate`]; [`MetricsSession`] sequences the
//! stages and keeps the enriched frame around for plotting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod derive;
pub mod frame;
pub mod quality;
pub mod rolling;
pub mod session;
pub mod table;

#[cfg(test)]
pub(crate) mod fixtures;

pub use derive::{build_derived_signals, gate_signal};
pub use frame::{extract_subject, parse_day_first, parse_export, SignalFrame, REQUIRED_COLUMNS};
pub use quality::{apply_quality_filter, interpolate_linear, QualityReport};
pub use rolling::{
    aggregate, per_minute_rate, rolling_sum, Aggregation, Metric, MetricsResult, RollingSeries,
    Window, WindowSpec,
};
pub use session::{compute_metrics, MetricsSession};
pub use table::CombinedTable;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WcsError {
    #[error("malformed export header: {0}")]
    MalformedHeader(String),
    #[error("failed to parse export: {0}")]
    Parse(String),
    #[error("invalid window spec: {0}")]
    InvalidWindowSpec(String),
    #[error("insufficient data: {samples} samples, smallest window needs {required}")]
    InsufficientData { samples: usize, required: usize },
}

/// Nominal device rate; window lengths are converted to sample counts with it.
pub const DEFAULT_SAMPLES_PER_SECOND: u32 = 10;

pub const HDOP_MAX: f64 = 2.0;
/// Fixes with this many satellites or fewer are untrusted.
pub const MIN_SATELLITES: f64 = 6.0;
/// Velocities above this are sensor artifacts rather than locomotion.
pub const VELOCITY_CEILING: f64 = 10.0;
pub const HSR_VELOCITY: f64 = 5.0;
pub const ACCEL_LOAD: f64 = 2.0;

/// Metadata lines preceding the column header row.
pub const HEADER_LINES: usize = 8;
/// Zero-based line holding the quoted subject name.
pub const SUBJECT_LINE: usize = 7;

pub const DEFAULT_WINDOW_START_S: u64 = 60;
pub const DEFAULT_WINDOW_END_S: u64 = 240;
pub const DEFAULT_WINDOW_STEP_S: u64 = 30;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub hdop_max: f64,
    pub min_satellites: f64,
    pub velocity_ceiling: f64,
    pub hsr_velocity: f64,
    pub accel_load: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            hdop_max: HDOP_MAX,
            min_satellites: MIN_SATELLITES,
            velocity_ceiling: VELOCITY_CEILING,
            hsr_velocity: HSR_VELOCITY,
            accel_load: ACCEL_LOAD,
        }
    }
}

/// When `distance_delta` is taken relative to quality filtering.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOrder {
    /// Clean the odometer, then difference it.
    FilterFirst,
    /// Difference the raw odometer and keep that delta through filtering.
    RawFirst,
}

impl Default for DeltaOrder {
    fn default() -> Self {
        DeltaOrder::FilterFirst
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub samples_per_second: u32,
    pub window_start_s: u64,
    pub window_end_s: u64,
    pub window_step_s: u64,
    /// Explicit window list in seconds; replaces the start/end/step range when non-empty.
    pub windows: Vec<u64>,
    pub thresholds: Thresholds,
    pub delta_order: DeltaOrder,
    pub header_lines: usize,
    pub subject_line: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            samples_per_second: DEFAULT_SAMPLES_PER_SECOND,
            window_start_s: DEFAULT_WINDOW_START_S,
            window_end_s: DEFAULT_WINDOW_END_S,
            window_step_s: DEFAULT_WINDOW_STEP_S,
            windows: Vec::new(),
            thresholds: Thresholds::default(),
            delta_order: DeltaOrder::default(),
            header_lines: HEADER_LINES,
            subject_line: SUBJECT_LINE,
        }
    }
}

impl Params {
    pub fn window_spec(&self) -> Result<WindowSpec, WcsError> {
        if self.windows.is_empty() {
            WindowSpec::from_range(
                self.window_start_s,
                self.window_end_s,
                self.window_step_s,
                self.samples_per_second,
            )
        } else {
            WindowSpec::from_seconds(&self.windows, self.samples_per_second)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_cover_one_to_four_minutes() {
        let spec = Params::default().window_spec().unwrap();
        let seconds: Vec<u64> = spec.windows().iter().map(|w| w.seconds).collect();
        assert_eq!(seconds, vec![60, 90, 120, 150, 180, 210, 240]);
        assert_eq!(spec.windows()[0].samples, 600);
    }

    #[test]
    fn explicit_windows_take_precedence() {
        let params = Params {
            windows: vec![10, 20],
            ..Params::default()
        };
        let spec = params.window_spec().unwrap();
        assert_eq!(spec.windows().len(), 2);
        assert_eq!(spec.windows()[1].samples, 200);
    }

    #[test]
    fn params_deserialize_with_partial_json() {
        let params: Params =
            serde_json::from_str(r#"{"window_end_s": 120, "delta_order": "raw_first"}"#).unwrap();
        assert_eq!(params.window_end_s, 120);
        assert_eq!(params.window_start_s, DEFAULT_WINDOW_START_S);
        assert_eq!(params.delta_order, DeltaOrder::RawFirst);
        assert_eq!(params.thresholds, Thresholds::default());
    }
}
