use std::collections::BTreeSet;
use std::io::Write;

use super::rolling::{Metric, MetricsResult};

/// One row per subject; columns are metric group × window.
#[derive(Clone, Debug, Default)]
pub struct CombinedTable {
    windows: Vec<u64>,
    rows: Vec<MetricsResult>,
}

impl CombinedTable {
    pub fn from_results(rows: Vec<MetricsResult>) -> Self {
        let windows: BTreeSet<u64> = rows.iter().flat_map(|r| r.windows.iter().copied()).collect();
        Self {
            windows: windows.into_iter().collect(),
            rows,
        }
    }

    pub fn windows(&self) -> &[u64] {
        &self.windows
    }

    pub fn rows(&self) -> &[MetricsResult] {
        &self.rows
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["subject".to_string()];
        for metric in Metric::ALL {
            for window in &self.windows {
                header.push(format!("{}_{}s", metric.label(), window));
            }
        }
        header
    }

    pub fn write_csv<W: Write>(&self, writer: &mut csv::Writer<W>) -> csv::Result<()> {
        writer.write_record(self.header())?;
        for row in &self.rows {
            let mut record = Vec::with_capacity(1 + Metric::ALL.len() * self.windows.len());
            record.push(row.subject.clone());
            for metric in Metric::ALL {
                for &window in &self.windows {
                    record.push(
                        row.peak(metric, window)
                            .map(|v| format!("{:.2}", v))
                            .unwrap_or_default(),
                    );
                }
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
