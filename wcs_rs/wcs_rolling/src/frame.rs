use chrono::NaiveDateTime;
use ndarray::Array1;
use tracing::debug;

use super::rolling::{Metric, RollingSeries};
use super::{Params, WcsError};

pub const REQUIRED_COLUMNS: [&str; 6] = [
    "Timestamp",
    "Odometer",
    "HDOP",
    "#Sats",
    "Velocity",
    "Acceleration",
];

/// Day-first layouts first; ISO layouts are unambiguous and accepted as well.
const TIMESTAMP_FORMATS: [&str; 6] = [
    "%d/%m/%Y %H:%M:%S%.f",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S%.f",
    "%d.%m.%Y %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Per-sample columns for one subject and session. Missing values are NaN.
#[derive(Clone, Debug)]
pub struct SignalFrame {
    pub timestamps: Vec<NaiveDateTime>,
    pub odometer: Array1<f64>,
    pub velocity: Array1<f64>,
    pub acceleration: Array1<f64>,
    pub hdop: Array1<f64>,
    pub num_satellites: Array1<f64>,
    pub distance_delta: Array1<f64>,
    /// NaN until the derived-signal stage runs.
    pub distance_delta_hsr: Array1<f64>,
    /// NaN until the derived-signal stage runs.
    pub distance_delta_accel: Array1<f64>,
    pub rolling: Vec<RollingSeries>,
}

impl SignalFrame {
    /// Build a frame from raw columns, sorting rows by timestamp and taking the
    /// first difference of the odometer.
    pub fn from_columns(
        timestamps: Vec<NaiveDateTime>,
        odometer: Vec<f64>,
        velocity: Vec<f64>,
        acceleration: Vec<f64>,
        hdop: Vec<f64>,
        num_satellites: Vec<f64>,
    ) -> Result<Self, WcsError> {
        let len = timestamps.len();
        if [
            odometer.len(),
            velocity.len(),
            acceleration.len(),
            hdop.len(),
            num_satellites.len(),
        ]
        .iter()
        .any(|&l| l != len)
        {
            return Err(WcsError::Parse("column lengths differ".into()));
        }

        let mut order: Vec<usize> = (0..len).collect();
        let sorted = timestamps.windows(2).all(|w| w[0] <= w[1]);
        if !sorted {
            debug!("export rows out of timestamp order; sorting {} rows", len);
            order.sort_by_key(|&i| timestamps[i]);
        }
        let pick = |column: &[f64]| Array1::from_iter(order.iter().map(|&i| column[i]));

        let odometer = pick(odometer.as_slice());
        let distance_delta = first_difference(&odometer);
        Ok(Self {
            timestamps: order.iter().map(|&i| timestamps[i]).collect(),
            velocity: pick(velocity.as_slice()),
            acceleration: pick(acceleration.as_slice()),
            hdop: pick(hdop.as_slice()),
            num_satellites: pick(num_satellites.as_slice()),
            distance_delta,
            distance_delta_hsr: Array1::from_elem(len, f64::NAN),
            distance_delta_accel: Array1::from_elem(len, f64::NAN),
            rolling: Vec::new(),
            odometer,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Seconds since the first sample, one entry per row.
    pub fn elapsed_seconds(&self) -> Vec<f64> {
        let Some(&start) = self.timestamps.first() else {
            return Vec::new();
        };
        self.timestamps
            .iter()
            .map(|t| (*t - start).num_milliseconds() as f64 / 1000.0)
            .collect()
    }

    /// The per-sample signal a metric group sums over.
    pub fn signal(&self, metric: Metric) -> &Array1<f64> {
        match metric {
            Metric::Distance => &self.distance_delta,
            Metric::HighSpeedDistance => &self.distance_delta_hsr,
            Metric::AccelerationLoad => &self.distance_delta_accel,
        }
    }

    /// Rolling rate series for one metric, ascending by window length.
    pub fn rolling_for(&self, metric: Metric) -> impl Iterator<Item = &RollingSeries> {
        self.rolling.iter().filter(move |s| s.metric == metric)
    }
}

pub(crate) fn first_difference(values: &Array1<f64>) -> Array1<f64> {
    let mut out = Array1::from_elem(values.len(), f64::NAN);
    for i in 1..values.len() {
        out[i] = values[i] - values[i - 1];
    }
    out
}

fn decode(raw: &[u8]) -> Result<&str, WcsError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| WcsError::Parse(format!("export is not valid UTF-8: {}", e)))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Pull the subject name out of the quoted segment on the identity header line.
pub fn extract_subject(raw: &[u8], params: &Params) -> Result<String, WcsError> {
    subject_from_text(decode(raw)?, params)
}

fn subject_from_text(text: &str, params: &Params) -> Result<String, WcsError> {
    let lines: Vec<&str> = text.lines().take(params.header_lines.max(10)).collect();
    if lines.len() < params.header_lines || params.subject_line >= lines.len() {
        return Err(WcsError::MalformedHeader(format!(
            "expected {} header lines, found {}",
            params.header_lines,
            lines.len()
        )));
    }
    let line = lines[params.subject_line];
    let segments: Vec<&str> = line.split('"').collect();
    if segments.len() < 3 {
        return Err(WcsError::MalformedHeader(format!(
            "line {} has no quoted subject name: {:?}",
            params.subject_line + 1,
            line
        )));
    }
    let name = segments[1].trim();
    if name.is_empty() {
        return Err(WcsError::MalformedHeader(format!(
            "line {} has an empty subject name",
            params.subject_line + 1
        )));
    }
    Ok(name.to_string())
}

pub fn parse_day_first(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

fn parse_number(value: &str, column: &str, row: usize) -> Result<f64, WcsError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(f64::NAN);
    }
    trimmed.parse::<f64>().map_err(|_| {
        WcsError::Parse(format!(
            "row {}: {} value {:?} is not a number",
            row, column, trimmed
        ))
    })
}

/// Parse one export into its subject name and a [`SignalFrame`].
pub fn parse_export(raw: &[u8], params: &Params) -> Result<(String, SignalFrame), WcsError> {
    let text = decode(raw)?;
    let subject = subject_from_text(text, params)?;

    let body_offset: usize = text
        .split_inclusive('\n')
        .take(params.header_lines)
        .map(str::len)
        .sum();
    let body = &text[body_offset..];

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| WcsError::Parse(format!("unreadable column header: {}", e)))?
        .clone();

    let mut index = [0usize; 6];
    for (slot, column) in index.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| WcsError::Parse(format!("missing required column '{}'", column)))?;
    }
    let [ts_idx, odo_idx, hdop_idx, sats_idx, vel_idx, acc_idx] = index;

    let mut timestamps = Vec::new();
    let mut odometer = Vec::new();
    let mut hdop = Vec::new();
    let mut sats = Vec::new();
    let mut velocity = Vec::new();
    let mut acceleration = Vec::new();

    for (i, record) in reader.records().enumerate() {
        // Report rows by their line in the export: header block, column row, then data.
        let row = params.header_lines + 2 + i;
        let record = record.map_err(|e| WcsError::Parse(format!("row {}: {}", row, e)))?;
        let field = |idx: usize| record.get(idx).unwrap_or("");

        let ts_raw = field(ts_idx);
        let ts = parse_day_first(ts_raw).ok_or_else(|| {
            WcsError::Parse(format!("row {}: unparseable timestamp {:?}", row, ts_raw))
        })?;
        timestamps.push(ts);
        odometer.push(parse_number(field(odo_idx), "Odometer", row)?);
        hdop.push(parse_number(field(hdop_idx), "HDOP", row)?);
        sats.push(parse_number(field(sats_idx), "#Sats", row)?);
        velocity.push(parse_number(field(vel_idx), "Velocity", row)?);
        acceleration.push(parse_number(field(acc_idx), "Acceleration", row)?);
    }

    debug!("parsed {} samples for {}", timestamps.len(), subject);
    let frame = SignalFrame::from_columns(timestamps, odometer, velocity, acceleration, hdop, sats)?;
    Ok((subject, frame))
}
