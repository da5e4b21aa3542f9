// src/main.rs
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, error, info, warn};
use ndarray::Array2;
use serde::Serialize;
use gfet_smu::analysis::{analysis, Dataset, HillAnalysis};
use gfet_smu::config::AcquisitionConfig;
use gfet_smu::drivers::{list_ports, SerialConnector, SimulatedConnector, SweepSnapshot, N_CHANNELS};
use gfet_smu::engine::{spawn_session, SessionHandle};
use gfet_smu::types::{EndReason, SessionEvent, SweepMode, SweepParameters};
#[derive(Parser)]
#[command(name = "gfet-smu")]
#[command(about = "16-channel SMU sweep acquisition and GFET sensor analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}
#[derive(Subcommand)]
enum Commands {
    /// List serial ports and their USB ids
    Ports,
    /// Run an acquisition and log it to CSV
    Sweep(SweepArgs),
    /// Derive Dirac shifts and fit a Hill curve from saved resistance sweeps
    Analyze(AnalyzeArgs),
}
#[derive(Args)]
struct SweepArgs {
    #[arg(long, value_enum, default_value_t = SweepMode::VoltageSweep)]
    mode: SweepMode,
    #[arg(long, default_value_t = -0.5, allow_negative_numbers = true)]
    v_min: f64,
    #[arg(long, default_value_t = 0.5, allow_negative_numbers = true)]
    v_max: f64,
    /// Fixed gate voltage for time sweeps
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    gate: f64,
    #[arg(long, default_value_t = 50.0)]
    delay_ms: f64,
    /// CSV file; defaults to a timestamped name in the working directory
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Serial port name, overriding discovery and the config file
    #[arg(long)]
    port: Option<String>,
    /// JSON acquisition config
    #[arg(long)]
    config: Option<PathBuf>,
    /// Use the built-in device simulator instead of hardware
    #[arg(long)]
    simulate: bool,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Stop after this many completed voltage sweeps
    #[arg(long)]
    max_sweeps: Option<u64>,
    /// Stop after this many seconds
    #[arg(long)]
    duration_s: Option<f64>,
}
#[derive(Clone, Copy, Debug, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Metric {
    DiracShift,
    NormalizedDirac,
    InitialShift,
    PositiveTransconductance,
    NegativeTransconductance,
    ConductanceShift,
    NormalizedConductanceShift,
}
#[derive(Args)]
struct AnalyzeArgs {
    /// Resistance sweep per concentration, lowest concentration first
    #[arg(required = true)]
    concentrations: Vec<PathBuf>,
    /// Aptamer-only baseline sweep
    #[arg(long)]
    aptamer: PathBuf,
    /// Initial Dirac baseline sweep
    #[arg(long)]
    initial: PathBuf,
    #[arg(long, value_enum, default_value_t = Metric::DiracShift)]
    metric: Metric,
    /// Gate voltage tracked by the conductance metrics
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    gate_voltage: f64,
    /// Concentration whose spread sets the noise level for LOD/LOQ
    #[arg(long, default_value_t = 0)]
    reference_index: usize,
    /// Only print the derived metric, skip the Hill fit
    #[arg(long)]
    no_fit: bool,
}
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Ports => print_ports(),
        Commands::Sweep(args) => run_sweep(args),
        Commands::Analyze(args) => run_analysis(args),
    }
}
fn print_ports() -> Result<()> {
    let ports = list_ports().context("failed to enumerate serial ports")?;
    println!("{}", serde_json::to_string_pretty(&ports)?);
    Ok(())
}
fn default_output_path(mode: SweepMode) -> PathBuf {
    let name = mode
        .to_possible_value()
        .map(|v| v.get_name().to_owned())
        .unwrap_or_else(|| "sweep".to_owned());
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    PathBuf::from(format!("{name}_{stamp}.csv"))
}
fn run_sweep(args: SweepArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::load(path)?,
        None => AcquisitionConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port_name = Some(port.clone());
    }
    let params = SweepParameters {
        mode: args.mode,
        v_min: args.v_min,
        v_max: args.v_max,
        gate_voltage: args.gate,
        step_delay_ms: args.delay_ms,
        output_path: args
            .output
            .clone()
            .unwrap_or_else(|| default_output_path(args.mode)),
    };
    params.validate().context("invalid sweep parameters")?;
    let handle = if args.simulate {
        info!("Using simulated SMU (seed {})", args.seed);
        spawn_session(SimulatedConnector::new(args.seed), config)
    } else {
        spawn_session(SerialConnector::new(config.clone()), config)
    };
    handle.start(params);
    let reason = drive(&handle, &args)?;
    handle.shutdown();
    match reason {
        EndReason::Failed(message) => bail!("acquisition failed: {message}"),
        reason => {
            info!("Acquisition ended: {reason:?}");
            Ok(())
        }
    }
}
#[derive(Serialize)]
struct SweepReport<'a> {
    sweep_index: u64,
    time_since_start: f64,
    dirac_voltages: &'a [Option<f64>; N_CHANNELS],
    mean_negative_transconductance_v: Option<f64>,
}
/// Pumps engine events until the run finishes, stopping it once the sweep or
/// time limit is reached.
fn drive(handle: &SessionHandle, args: &SweepArgs) -> Result<EndReason> {
    let deadline = args
        .duration_s
        .map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    let all_channels = [true; N_CHANNELS];
    let mut started = false;
    let mut stopping = false;
    let mut completed_sweeps = 0u64;
    let mut latest: Option<SweepSnapshot> = None;
    loop {
        if !stopping && deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Time limit reached, stopping");
            handle.stop();
            stopping = true;
        }
        let event = match handle.events().recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => bail!("acquisition thread exited"),
        };
        match event {
            SessionEvent::Log(message) => info!("{message}"),
            SessionEvent::Status(running) => started |= running,
            SessionEvent::Snapshot(snapshot) => {
                debug!(
                    "Sweep {}: {} points, y-range {:?}",
                    snapshot.sweep_index,
                    snapshot.currents.first().map_or(0, Vec::len),
                    snapshot.y_range(&all_channels, 0.05)
                );
                latest = Some(snapshot);
            }
            SessionEvent::SweepCompleted(summary) => {
                let report = SweepReport {
                    sweep_index: summary.sweep_index,
                    time_since_start: summary.time_since_start,
                    dirac_voltages: &summary.dirac_voltages,
                    mean_negative_transconductance_v: latest
                        .as_ref()
                        .and_then(|s| s.negative_transconductance_points(&all_channels))
                        .map(|(_, mean)| mean),
                };
                println!("{}", serde_json::to_string(&report)?);
                completed_sweeps += 1;
                if !stopping && args.max_sweeps.is_some_and(|max| completed_sweeps >= max) {
                    info!("Completed {completed_sweeps} sweeps, stopping");
                    handle.stop();
                    stopping = true;
                }
            }
            SessionEvent::Error(message) => {
                if !started {
                    bail!("could not start acquisition: {message}");
                }
                error!("{message}");
            }
            SessionEvent::Finished(reason) => {
                if let Some(snapshot) = &latest {
                    if snapshot.currents.iter().all(Vec::is_empty) {
                        warn!("No records were received");
                    }
                }
                return Ok(reason);
            }
        }
    }
}
#[derive(Serialize)]
struct AnalysisReport {
    num_concentrations: usize,
    num_devices: usize,
    voltage_points: usize,
    metric: Metric,
    dirac_voltages: Vec<Vec<f64>>,
    values: Vec<Vec<f64>>,
    fit: Option<HillAnalysis>,
}
fn rows(table: &Array2<f64>) -> Vec<Vec<f64>> {
    table.outer_iter().map(|row| row.to_vec()).collect()
}
fn run_analysis(args: AnalyzeArgs) -> Result<()> {
    let dataset = Dataset::load(&args.concentrations, &args.aptamer, &args.initial)
        .context("failed to load sweep files")?;
    let values = match args.metric {
        Metric::DiracShift => dataset.adjusted_dirac_voltages(),
        Metric::NormalizedDirac => dataset.normalized_dirac_voltages(),
        Metric::InitialShift => dataset.dirac_shift_from_initial(),
        Metric::PositiveTransconductance => dataset.positive_transconductance_voltages(),
        Metric::NegativeTransconductance => dataset.negative_transconductance_voltages(),
        Metric::ConductanceShift => dataset.conductance_shifts(args.gate_voltage),
        Metric::NormalizedConductanceShift => {
            dataset.normalized_conductance_shifts(args.gate_voltage)
        }
    };
    let fit = if args.no_fit {
        None
    } else {
        Some(analysis(&values, args.reference_index).context("Hill fit failed")?)
    };
    let report = AnalysisReport {
        num_concentrations: dataset.num_concentrations(),
        num_devices: dataset.num_devices(),
        voltage_points: dataset.voltages().len(),
        metric: args.metric,
        dirac_voltages: rows(&dataset.dirac_voltages()),
        values: rows(&values),
        fit,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
