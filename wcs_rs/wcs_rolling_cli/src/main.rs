use std::collections::BTreeSet;
use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::panic;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use plotters::coord::Shift;
use plotters::prelude::*;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use wcs_rolling::{
    compute_metrics, CombinedTable, DeltaOrder, Metric, MetricsResult, MetricsSession, Params,
    SignalFrame,
};

/// Processed exports are moved here, next to where they were found.
const COMPLETED_DIR: &str = "completed_files";

#[derive(Parser, Debug)]
#[command(author, version, about = "Rolling workload metrics for GPS tracking exports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute peak rolling metrics for many exports into one combined table
    Batch(BatchArgs),
    /// Compute metrics for one export and optionally render its heatmap
    Session(SessionArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct MetricArgs {
    /// JSON parameter file; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Shortest window in seconds
    #[arg(long)]
    min: Option<u64>,

    /// Longest window in seconds
    #[arg(long)]
    max: Option<u64>,

    /// Window step in seconds
    #[arg(long)]
    step: Option<u64>,

    /// Explicit windows (comma separated seconds); overrides --min/--max/--step
    #[arg(long)]
    windows: Option<String>,

    /// Device sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Difference the raw odometer before quality filtering
    #[arg(long, action = ArgAction::SetTrue)]
    raw_first: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    /// Export files to process
    #[arg(value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Directory to scan for `.csv` exports
    #[arg(long, value_hint = ValueHint::DirPath)]
    dir: Option<PathBuf>,

    /// Combined table path (`-` for stdout)
    #[arg(short, long, default_value = "rolling_averages.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Also write per-subject results as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Move processed exports into a `completed_files` directory
    #[arg(long, action = ArgAction::SetTrue)]
    move_completed: bool,

    #[command(flatten)]
    metrics: MetricArgs,
}

#[derive(Parser, Debug)]
struct SessionArgs {
    /// Export file to process
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Heatmap image path (`.png` or `.svg`)
    #[arg(long, value_hint = ValueHint::FilePath)]
    heatmap: Option<PathBuf>,

    #[command(flatten)]
    metrics: MetricArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Batch(args) => args.metrics.verbose,
        Command::Session(args) => args.metrics.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Batch(args) => handle_batch(args),
        Command::Session(args) => handle_session(args),
    }
}

fn build_params(args: &MetricArgs) -> Result<Params> {
    let mut params = match args.config.as_ref() {
        Some(path) => load_params(path)?,
        None => Params::default(),
    };

    if args.min.is_some() || args.max.is_some() || args.step.is_some() {
        params.windows.clear();
    }
    if let Some(min) = args.min {
        params.window_start_s = min;
    }
    if let Some(max) = args.max {
        params.window_end_s = max;
    }
    if let Some(step) = args.step {
        params.window_step_s = step;
    }
    if let Some(list) = args.windows.as_ref() {
        let windows = parse_window_list(list)?;
        if windows.is_empty() {
            return Err(anyhow!("--windows list was empty"));
        }
        params.windows = windows;
    }
    if let Some(rate) = args.sample_rate {
        params.samples_per_second = rate;
    }
    if args.raw_first {
        params.delta_order = DeltaOrder::RawFirst;
    }

    // Surface bad window settings before touching any export.
    params.window_spec()?;
    Ok(params)
}

fn load_params(path: &Path) -> Result<Params> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a valid config", path.display()))
}

fn parse_window_list(input: &str) -> Result<Vec<u64>> {
    let mut out = Vec::new();
    for token in input.split(',') {
        let trimmed = token.trim().trim_end_matches('s');
        if trimmed.is_empty() {
            continue;
        }
        let value: u64 = trimmed
            .parse()
            .with_context(|| format!("invalid window '{}': expected integer seconds", trimmed))?;
        if value == 0 {
            return Err(anyhow!("window lengths must be > 0"));
        }
        out.push(value);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Non-hidden `.csv` files directly inside `dir`, sorted by name.
fn discover_exports(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
        if is_csv && !name.starts_with('.') {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn process_export(path: &Path, params: &Params) -> Result<MetricsResult> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    compute_metrics(&data, params).with_context(|| format!("failed to process {}", path.display()))
}

#[derive(Debug, Default)]
struct BatchOutcome {
    processed: Vec<(PathBuf, MetricsResult)>,
    failed: Vec<(PathBuf, String)>,
}

/// One independent session per export; a failing export never stops the rest.
fn run_batch(paths: &[PathBuf], params: &Params) -> BatchOutcome {
    let results: Vec<(PathBuf, Result<MetricsResult>)> = paths
        .par_iter()
        .map(|path| (path.clone(), process_export(path, params)))
        .collect();

    let mut outcome = BatchOutcome::default();
    for (path, result) in results {
        match result {
            Ok(metrics) => outcome.processed.push((path, metrics)),
            Err(err) => outcome.failed.push((path, format!("{:#}", err))),
        }
    }
    outcome
}

fn handle_batch(args: BatchArgs) -> Result<()> {
    let params = build_params(&args.metrics)?;

    let mut inputs: BTreeSet<PathBuf> = args.inputs.iter().cloned().collect();
    if let Some(dir) = args.dir.as_ref() {
        inputs.extend(discover_exports(dir)?);
    }
    // A previous run's table can sit next to the exports.
    inputs.retain(|p| p != &args.output);
    let inputs: Vec<PathBuf> = inputs.into_iter().collect();
    if inputs.is_empty() {
        return Err(anyhow!("no exports to process"));
    }

    let t_compute = Instant::now();
    let outcome = run_batch(&inputs, &params);
    info!(
        "Processed {} of {} exports in {:.1} ms",
        outcome.processed.len(),
        inputs.len(),
        t_compute.elapsed().as_secs_f64() * 1000.0
    );
    for (path, err) in &outcome.failed {
        warn!("Skipping {}: {}", path.display(), err);
    }
    if outcome.processed.is_empty() {
        return Err(anyhow!("all {} exports failed", inputs.len()));
    }

    let results: Vec<MetricsResult> = outcome
        .processed
        .iter()
        .map(|(_, result)| result.clone())
        .collect();

    if let Some(path) = args.json.as_ref() {
        write_json(&results, path)?;
        info!("Wrote results JSON: {}", path.display());
    }

    let table = CombinedTable::from_results(results);
    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut writer = csv::Writer::from_writer(stdout.lock());
        table.write_csv(&mut writer)?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        table.write_csv(&mut writer)?;
        info!(
            "Wrote combined table: {} ({} subjects)",
            args.output.display(),
            table.rows().len()
        );
    }

    if args.move_completed {
        let done: Vec<PathBuf> = outcome.processed.into_iter().map(|(p, _)| p).collect();
        let moved = move_completed(&done)?;
        info!("Moved {} exports to {}", moved.len(), COMPLETED_DIR);
    }

    Ok(())
}

/// Relocate each file into `completed_files/` beside it, creating the directory on demand.
fn move_completed(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut moved = Vec::with_capacity(paths.len());
    for path in paths {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
        let target_dir = parent.join(COMPLETED_DIR);
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("failed to create {}", target_dir.display()))?;
        let target = target_dir.join(name);
        fs::rename(path, &target).with_context(|| {
            format!("failed to move {} to {}", path.display(), target.display())
        })?;
        debug!("moved {} -> {}", path.display(), target.display());
        moved.push(target);
    }
    Ok(moved)
}

fn write_json(results: &[MetricsResult], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, results)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn handle_session(args: SessionArgs) -> Result<()> {
    let params = build_params(&args.metrics)?;
    let data = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;

    let t_compute = Instant::now();
    let mut session = MetricsSession::new(&data, params);
    let result = session
        .run()
        .with_context(|| format!("failed to process {}", args.input.display()))?;
    if let Some(report) = session.quality_report() {
        info!(
            "{}: {} fixes invalidated, {} interpolated, {} unresolved ({:.1} ms)",
            result.subject,
            report.invalidated,
            report.interpolated,
            report.unresolved,
            t_compute.elapsed().as_secs_f64() * 1000.0
        );
    }

    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        write_session(&result, args.format, stdout.lock())?;
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        write_session(&result, args.format, file)?;
        info!("Wrote session metrics: {}", args.output.display());
    }

    if let (Some(path), Some(frame)) = (args.heatmap.as_ref(), session.enriched_frame()) {
        let kind = ChartKind::from_path(path);
        if let Err(err) = render_heatmap_guard(frame, &result.subject, path, kind) {
            warn!("Skipping heatmap render ({}): {}", path.display(), err);
        } else {
            info!("Wrote heatmap: {}", path.display());
        }
    }

    Ok(())
}

fn write_session<W: Write>(result: &MetricsResult, format: OutputFormat, out: W) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(out, result)?;
            Ok(())
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            write_session_rows(result, &mut writer)
        }
    }
}

fn write_session_rows<W: Write>(result: &MetricsResult, writer: &mut csv::Writer<W>) -> Result<()> {
    let mut header = vec!["window_s".to_string()];
    header.extend(Metric::ALL.iter().map(|m| m.label().to_string()));
    writer.write_record(&header)?;

    for &window in &result.windows {
        let mut record = vec![window.to_string()];
        for metric in Metric::ALL {
            record.push(
                result
                    .peak(metric, window)
                    .map(|v| format!("{:.2}", v))
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChartKind {
    Png,
    Svg,
}

impl ChartKind {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("svg") => ChartKind::Svg,
            _ => ChartKind::Png,
        }
    }
}

const HEATMAP_SIZE: (u32, u32) = (1400, 960);
/// Columns drawn per panel; longer sessions are strided.
const HEATMAP_MAX_COLUMNS: usize = 900;

fn render_heatmap_guard(
    frame: &SignalFrame,
    subject: &str,
    path: &Path,
    kind: ChartKind,
) -> Result<(), String> {
    let render = || -> Result<(), String> {
        let drawn = match kind {
            ChartKind::Png => {
                let root = BitMapBackend::new(path, HEATMAP_SIZE).into_drawing_area();
                draw_heatmap(root, frame, subject)
            }
            ChartKind::Svg => {
                let root = SVGBackend::new(path, HEATMAP_SIZE).into_drawing_area();
                draw_heatmap(root, frame, subject)
            }
        };
        drawn.map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn heat_color(value: f64, peak: f64) -> HSLColor {
    let t = if peak > 0.0 {
        (value / peak).clamp(0.0, 1.0)
    } else {
        0.0
    };
    // Blue for low rates through to red at the session peak.
    HSLColor((1.0 - t) * 240.0 / 360.0, 0.85, 0.5)
}

/// One panel per metric: x = elapsed seconds, y = window, colour = per-minute rate.
fn draw_heatmap<DB>(root: DrawingArea<DB, Shift>, frame: &SignalFrame, subject: &str) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    let root = root.titled(subject, ("sans-serif", 28))?;
    let panels = root.split_evenly((Metric::ALL.len(), 1));

    let elapsed = frame.elapsed_seconds();
    let n = elapsed.len();
    if n < 2 {
        return Err(anyhow!("not enough samples to plot"));
    }
    let x_max = elapsed[n - 1].max(1.0);
    let stride = (n / HEATMAP_MAX_COLUMNS).max(1);

    for (panel, metric) in panels.iter().zip(Metric::ALL) {
        let series: Vec<_> = frame.rolling_for(metric).collect();
        if series.is_empty() {
            continue;
        }
        let labels: Vec<String> = series.iter().map(|s| format!("{}s", s.window_s)).collect();
        let peak = series
            .iter()
            .filter_map(|s| s.peak())
            .fold(0.0_f64, f64::max);

        let mut chart = ChartBuilder::on(panel)
            .caption(format!("{} (peak {:.1})", metric.name(), peak), ("sans-serif", 20))
            .margin(10)
            .set_label_area_size(LabelAreaPosition::Left, 60)
            .set_label_area_size(LabelAreaPosition::Bottom, 35)
            .build_cartesian_2d(0.0..x_max, 0.0..series.len() as f64)?;

        chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("elapsed (s)")
            .y_labels(series.len())
            .y_label_formatter(&|v| labels.get(v.floor() as usize).cloned().unwrap_or_default())
            .draw()?;

        for (row, s) in series.iter().enumerate() {
            let y0 = row as f64;
            let cells = (0..n).step_by(stride).filter_map(|i| {
                let rate = s.rates[i]?;
                let x1 = elapsed[(i + stride).min(n - 1)];
                Some(Rectangle::new(
                    [(elapsed[i], y0), (x1, y0 + 1.0)],
                    heat_color(rate, peak).filled(),
                ))
            });
            chart.draw_series(cells)?;
        }
    }

    root.present()?;
    Ok(())
}
