use std::collections::BTreeMap;
use std::fmt;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use super::frame::SignalFrame;
use super::WcsError;

/// The three per-minute workload groups reported for every window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "M/min")]
    Distance,
    #[serde(rename = "HSR/min")]
    HighSpeedDistance,
    #[serde(rename = "Accel/min")]
    AccelerationLoad,
}

impl Metric {
    pub const ALL: [Metric; 3] = [
        Metric::Distance,
        Metric::HighSpeedDistance,
        Metric::AccelerationLoad,
    ];

    /// Short column label used in tables.
    pub fn label(&self) -> &'static str {
        match self {
            Metric::Distance => "M/min",
            Metric::HighSpeedDistance => "HSR/min",
            Metric::AccelerationLoad => "Accel/min",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Distance => "distance/min",
            Metric::HighSpeedDistance => "high-speed-distance/min",
            Metric::AccelerationLoad => "acceleration-load/min",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub seconds: u64,
    pub samples: usize,
}

/// Ordered, validated set of rolling windows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    windows: Vec<Window>,
    samples_per_second: u32,
}

impl WindowSpec {
    /// Windows `start, start + step, ..` up to and including `end`, in seconds.
    pub fn from_range(
        start_s: u64,
        end_s: u64,
        step_s: u64,
        samples_per_second: u32,
    ) -> Result<Self, WcsError> {
        if step_s == 0 {
            return Err(WcsError::InvalidWindowSpec("step must be > 0".into()));
        }
        if start_s == 0 {
            return Err(WcsError::InvalidWindowSpec("start must be > 0".into()));
        }
        if end_s < start_s {
            return Err(WcsError::InvalidWindowSpec(format!(
                "end {}s is before start {}s",
                end_s, start_s
            )));
        }
        let seconds: Vec<u64> = (start_s..=end_s).step_by(step_s as usize).collect();
        Self::from_seconds(&seconds, samples_per_second)
    }

    pub fn from_seconds(seconds: &[u64], samples_per_second: u32) -> Result<Self, WcsError> {
        if samples_per_second == 0 {
            return Err(WcsError::InvalidWindowSpec(
                "samples per second must be > 0".into(),
            ));
        }
        if seconds.is_empty() {
            return Err(WcsError::InvalidWindowSpec("no windows".into()));
        }
        if seconds.contains(&0) {
            return Err(WcsError::InvalidWindowSpec("window lengths must be > 0".into()));
        }
        if seconds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(WcsError::InvalidWindowSpec(
                "window lengths must be strictly increasing".into(),
            ));
        }
        let windows = seconds
            .iter()
            .map(|&s| {
                s.checked_mul(u64::from(samples_per_second))
                    .and_then(|n| usize::try_from(n).ok())
                    .map(|samples| Window { seconds: s, samples })
                    .ok_or_else(|| {
                        WcsError::InvalidWindowSpec(format!(
                            "{}s at {} Hz is too many samples",
                            s, samples_per_second
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            windows,
            samples_per_second,
        })
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn samples_per_second(&self) -> u32 {
        self.samples_per_second
    }

    pub fn smallest(&self) -> Option<&Window> {
        self.windows.first()
    }
}

/// Per-minute rate of one (metric, window) pair at every sample of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollingSeries {
    pub metric: Metric,
    pub window_s: u64,
    /// `None` until the window fills, or where it spans a missing value.
    pub rates: Vec<Option<f64>>,
}

impl RollingSeries {
    pub fn peak(&self) -> Option<f64> {
        self.rates.iter().flatten().copied().reduce(f64::max)
    }
}

/// Peak per-minute rates for one subject.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsResult {
    pub subject: String,
    pub windows: Vec<u64>,
    pub peaks: BTreeMap<Metric, BTreeMap<u64, Option<f64>>>,
}

impl MetricsResult {
    pub fn peak(&self, metric: Metric, window_s: u64) -> Option<f64> {
        self.peaks.get(&metric)?.get(&window_s).copied().flatten()
    }
}

#[derive(Clone, Debug)]
pub struct Aggregation {
    pub result: MetricsResult,
    pub series: Vec<RollingSeries>,
}

/// Sums smaller than this are sliding-update residue and read as zero.
const SUM_EPSILON: f64 = 1e-9;

/// Sum over `[i + 1 - window, i]` at every `i`.
///
/// Positions before the window fills, and spans containing a NaN, are `None`.
pub fn rolling_sum(values: ArrayView1<f64>, window: usize) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    let mut missing = 0usize;
    for i in 0..values.len() {
        let incoming = values[i];
        if incoming.is_nan() {
            missing += 1;
        } else {
            sum += incoming;
        }
        if i >= window {
            let outgoing = values[i - window];
            if outgoing.is_nan() {
                missing -= 1;
            } else {
                sum -= outgoing;
            }
        }
        if i + 1 >= window && missing == 0 {
            out.push(Some(if sum.abs() < SUM_EPSILON { 0.0 } else { sum }));
        } else {
            out.push(None);
        }
    }
    out
}

pub fn per_minute_rate(
    sum: f64,
    window: &Window,
    samples_per_second: u32,
) -> Result<f64, WcsError> {
    if window.samples == 0 || samples_per_second == 0 {
        return Err(WcsError::InvalidWindowSpec(format!(
            "zero-length window ({} samples at {} Hz)",
            window.samples, samples_per_second
        )));
    }
    let window_s = window.samples as f64 / samples_per_second as f64;
    Ok(sum / (window_s / 60.0))
}

/// Length of the longest stretch without a missing value.
fn longest_defined_run(values: ArrayView1<f64>) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for v in values.iter() {
        if v.is_nan() {
            run = 0;
        } else {
            run += 1;
            longest = longest.max(run);
        }
    }
    longest
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Evaluate every (metric, window) pair over a derived frame.
pub fn aggregate(
    subject: &str,
    frame: &SignalFrame,
    spec: &WindowSpec,
) -> Result<Aggregation, WcsError> {
    // The smallest window must fill at least once. The first delta is always
    // missing, so W samples need W + 1 fixes.
    let required = spec.smallest().map(|w| w.samples).unwrap_or(0);
    let defined = longest_defined_run(frame.distance_delta.view());
    if defined < required {
        return Err(WcsError::InsufficientData {
            samples: defined,
            required,
        });
    }

    let sps = spec.samples_per_second();
    let mut peaks: BTreeMap<Metric, BTreeMap<u64, Option<f64>>> = BTreeMap::new();
    let mut series = Vec::with_capacity(Metric::ALL.len() * spec.windows().len());

    for window in spec.windows() {
        for metric in Metric::ALL {
            let sums = rolling_sum(frame.signal(metric).view(), window.samples);
            let rates = sums
                .into_iter()
                .map(|s| s.map(|sum| per_minute_rate(sum, window, sps)).transpose())
                .collect::<Result<Vec<_>, _>>()?;
            let rolling = RollingSeries {
                metric,
                window_s: window.seconds,
                rates,
            };
            peaks
                .entry(metric)
                .or_default()
                .insert(window.seconds, rolling.peak().map(round2));
            series.push(rolling);
        }
    }

    // Keep each metric's series contiguous and ascending by window.
    series.sort_by_key(|s| (s.metric, s.window_s));

    Ok(Aggregation {
        result: MetricsResult {
            subject: subject.to_string(),
            windows: spec.windows().iter().map(|w| w.seconds).collect(),
            peaks,
        },
        series,
    })
}
