use tracing::debug;

use super::derive::build_derived_signals;
use super::frame::{parse_export, SignalFrame};
use super::quality::{apply_quality_filter, QualityReport};
use super::rolling::{aggregate, MetricsResult};
use super::{Params, WcsError};

/// Runs the full pipeline over one raw export.
///
/// Each session owns its own frame; build a fresh one per export.
#[derive(Debug)]
pub struct MetricsSession<'a> {
    raw: &'a [u8],
    params: Params,
    frame: Option<SignalFrame>,
    quality: Option<QualityReport>,
}

impl<'a> MetricsSession<'a> {
    pub fn new(raw: &'a [u8], params: Params) -> Self {
        Self {
            raw,
            params,
            frame: None,
            quality: None,
        }
    }

    /// Parse, clean, derive and aggregate. Re-running recomputes from the raw
    /// bytes, and a failed run leaves no enriched frame behind.
    pub fn run(&mut self) -> Result<MetricsResult, WcsError> {
        self.frame = None;
        self.quality = None;

        let spec = self.params.window_spec()?;
        let (subject, frame) = parse_export(self.raw, &self.params)?;
        let (frame, report) =
            apply_quality_filter(frame, &self.params.thresholds, self.params.delta_order);
        let mut frame = build_derived_signals(frame, &self.params.thresholds);
        let aggregation = aggregate(&subject, &frame, &spec)?;
        frame.rolling = aggregation.series;

        debug!(
            "{}: {} samples, {} windows",
            subject,
            frame.len(),
            spec.windows().len()
        );
        self.frame = Some(frame);
        self.quality = Some(report);
        Ok(aggregation.result)
    }

    /// Post-pipeline frame with rolling series; `None` before a successful run.
    pub fn enriched_frame(&self) -> Option<&SignalFrame> {
        self.frame.as_ref()
    }

    pub fn quality_report(&self) -> Option<QualityReport> {
        self.quality
    }
}

pub fn compute_metrics(raw: &[u8], params: &Params) -> Result<MetricsResult, WcsError> {
    MetricsSession::new(raw, params.clone()).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{export_bytes, steady_run};
    use crate::rolling::Metric;
    use crate::DeltaOrder;

    fn one_minute() -> Params {
        Params {
            windows: vec![60],
            ..Params::default()
        }
    }

    #[test]
    fn runs_end_to_end() {
        let raw = export_bytes("Sam Lee", &steady_run(601, 0.05, 6.0, 2.5));
        let mut session = MetricsSession::new(&raw, one_minute());
        let result = session.run().unwrap();
        assert_eq!(result.subject, "Sam Lee");
        assert_eq!(result.windows, vec![60]);
        for metric in Metric::ALL {
            assert_eq!(result.peak(metric, 60), Some(30.0), "{}", metric);
        }
        let frame = session.enriched_frame().unwrap();
        assert_eq!(frame.rolling.len(), 3);
        assert_eq!(frame.rolling_for(Metric::HighSpeedDistance).count(), 1);
        assert_eq!(session.quality_report().unwrap().invalidated, 0);
    }

    #[test]
    fn rerunning_is_deterministic() {
        let mut samples = steady_run(1500, 0.4, 5.5, 1.0);
        samples[300].satellites = 3.0;
        samples[700].hdop = 4.2;
        let raw = export_bytes("Alex", &samples);
        let params = Params::default();
        let mut session = MetricsSession::new(&raw, params.clone());
        let first = session.run().unwrap();
        let second = session.run().unwrap();
        assert_eq!(first, second);
        assert_eq!(first, compute_metrics(&raw, &params).unwrap());
    }

    #[test]
    fn satellite_dropout_is_interpolated_in_enriched_frame() {
        let mut samples = steady_run(700, 0.5, 4.0, 0.0);
        samples[350].odometer = 10_000.0;
        samples[350].satellites = 4.0;
        let raw = export_bytes("Alex", &samples);
        let mut session = MetricsSession::new(&raw, one_minute());
        let result = session.run().unwrap();
        let frame = session.enriched_frame().unwrap();
        let cleaned = frame.odometer[350];
        assert!(cleaned > frame.odometer[349] && cleaned < frame.odometer[351]);
        assert_eq!(result.peak(Metric::Distance, 60), Some(300.0));
    }

    #[test]
    fn raw_first_order_lets_spikes_through() {
        let mut samples = steady_run(700, 0.5, 4.0, 0.0);
        // Near the end so some windows hold the jump without the drop back.
        samples[650].odometer = 10_000.0;
        samples[650].hdop = 3.0;
        let raw = export_bytes("Alex", &samples);
        let filtered = compute_metrics(&raw, &one_minute()).unwrap();
        let raw_first = compute_metrics(
            &raw,
            &Params {
                delta_order: DeltaOrder::RawFirst,
                ..one_minute()
            },
        )
        .unwrap();
        let clean_peak = filtered.peak(Metric::Distance, 60).unwrap();
        let spiky_peak = raw_first.peak(Metric::Distance, 60).unwrap();
        assert!(spiky_peak > clean_peak * 10.0, "{} vs {}", spiky_peak, clean_peak);
    }

    #[test]
    fn failed_run_has_no_enriched_frame() {
        let raw = export_bytes("Alex", &steady_run(100, 0.5, 4.0, 0.0));
        let mut session = MetricsSession::new(&raw, one_minute());
        let err = session.run().unwrap_err();
        assert!(matches!(err, WcsError::InsufficientData { .. }));
        assert!(session.enriched_frame().is_none());
    }

    #[test]
    fn invalid_windows_fail_before_parsing() {
        let params = Params {
            window_step_s: 0,
            ..Params::default()
        };
        let err = compute_metrics(b"garbage", &params).unwrap_err();
        assert!(matches!(err, WcsError::InvalidWindowSpec(_)));
    }

    #[test]
    fn malformed_header_surfaces_from_session() {
        let err = compute_metrics(b"one\ntwo\nthree\n", &Params::default()).unwrap_err();
        assert!(matches!(err, WcsError::MalformedHeader(_)));
    }
}
