//! Synthetic exports shared by the unit tests.

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::frame::SignalFrame;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Sample {
    pub odometer: f64,
    pub hdop: f64,
    pub satellites: f64,
    pub velocity: f64,
    pub acceleration: f64,
}

impl Sample {
    pub fn clean(odometer: f64, velocity: f64, acceleration: f64) -> Self {
        Self {
            odometer,
            hdop: 0.8,
            satellites: 12.0,
            velocity,
            acceleration,
        }
    }
}

/// `n` good fixes advancing `step_m` metres each.
pub(crate) fn steady_run(n: usize, step_m: f64, velocity: f64, acceleration: f64) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::clean(i as f64 * step_m, velocity, acceleration))
        .collect()
}

fn start_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 19)
        .and_then(|d| d.and_hms_opt(10, 0, 0))
        .unwrap()
}

fn timestamp(i: usize) -> NaiveDateTime {
    start_time() + Duration::milliseconds(100 * i as i64)
}

pub(crate) fn export_text(subject: &str, samples: &[Sample]) -> String {
    let mut text = String::new();
    text.push_str("Exported Data\n");
    text.push_str("Device: GPSports EVO\n");
    text.push_str("Firmware: 3.2.1\n");
    text.push_str("Session Date: 19/10/2026\n");
    text.push_str("Session: Training\n");
    text.push_str("Team: First XV\n");
    text.push_str("Sample Rate: 10Hz\n");
    text.push_str(&format!("Athlete: \"{}\",,,\n", subject));
    text.push_str("Timestamp,Odometer,HDOP,#Sats,Velocity,Acceleration,Heart Rate\n");
    for (i, s) in samples.iter().enumerate() {
        text.push_str(&format!(
            "{},{},{},{},{},{},140\n",
            timestamp(i).format("%d/%m/%Y %H:%M:%S%.3f"),
            s.odometer,
            s.hdop,
            s.satellites,
            s.velocity,
            s.acceleration
        ));
    }
    text
}

pub(crate) fn export_bytes(subject: &str, samples: &[Sample]) -> Vec<u8> {
    export_text(subject, samples).into_bytes()
}

pub(crate) fn frame_from(samples: &[Sample]) -> SignalFrame {
    SignalFrame::from_columns(
        (0..samples.len()).map(timestamp).collect(),
        samples.iter().map(|s| s.odometer).collect(),
        samples.iter().map(|s| s.velocity).collect(),
        samples.iter().map(|s| s.acceleration).collect(),
        samples.iter().map(|s| s.hdop).collect(),
        samples.iter().map(|s| s.satellites).collect(),
    )
    .unwrap()
}
