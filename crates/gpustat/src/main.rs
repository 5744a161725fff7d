//! gpustat - GPU metrics sampler.
//!
//! Samples metrics from NVIDIA GPUs through `nvidia-smi` at a fixed interval
//! and prints the collected series as JSON when done.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use gpustat_core::{
    ColumnarSamples, MetricRegistry, NvidiaSmi, NvidiaSmiConfig, QueryEngine, QueryError, Sample,
    SamplerConfig, SamplingSession, SessionState, StaticInfo, collect_for,
};

/// GPU metrics sampler.
#[derive(Parser)]
#[command(name = "gpustat", about = "GPU metrics sampler", version)]
struct Args {
    /// Sampling interval in seconds.
    #[arg(short, long, default_value = "1.0", env = "GPUSTAT_INTERVAL")]
    interval: f64,

    /// Total collection time in seconds. Samples until Ctrl-C if omitted.
    #[arg(short, long)]
    duration: Option<f64>,

    /// Devices to sample (comma separated). Defaults to all devices.
    #[arg(long, value_delimiter = ',')]
    devices: Vec<u32>,

    /// Metrics to sample (comma separated). Defaults to all dynamic metrics.
    #[arg(short, long, value_delimiter = ',')]
    metrics: Vec<String>,

    /// Path to the nvidia-smi binary.
    #[arg(long, default_value = "nvidia-smi", env = "GPUSTAT_SMI_PATH")]
    smi_path: String,

    /// Timeout for a single nvidia-smi invocation in seconds (0 disables).
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Print the known metrics and exit.
    #[arg(long)]
    list_metrics: bool,

    /// Print the available devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Print static information of the selected devices and exit.
    #[arg(long)]
    static_info: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Logs go to stderr so stdout carries only the JSON output.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["gpustat", "gpustat_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Formats the metric registry as an aligned table.
fn format_metric_table(registry: &MetricRegistry) -> String {
    let width = registry.ids().iter().map(|id| id.len()).max().unwrap_or(0);
    let mut out = String::new();
    for def in registry.iter() {
        let kind = if def.is_static { "static" } else { "dynamic" };
        out.push_str(&format!(
            "{:<width$}  {:<5}  {:<7}  {}\n",
            def.id,
            def.value_type.name(),
            kind,
            def.description,
            width = width
        ));
    }
    out
}

/// Describes a sample buffer for logging.
fn describe_samples(samples: &[Sample]) -> String {
    let devices: std::collections::BTreeSet<u32> = samples
        .iter()
        .flat_map(|s| s.data.keys().copied())
        .collect();
    format!("{} samples across {} devices", samples.len(), devices.len())
}

/// Converts a seconds argument, rejecting negative, non-finite and
/// out-of-range values.
fn seconds(value: f64, name: &str) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("invalid {} {}: {}", name, value, e))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

/// Samples in the background until Ctrl-C or a failed tick.
fn sample_until_interrupted(
    engine: Arc<QueryEngine>,
    config: SamplerConfig,
) -> Result<Vec<Sample>, QueryError> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let mut session = SamplingSession::new(engine, config)?;
    session.start()?;
    info!("Sampling, press Ctrl-C to stop");

    while running.load(Ordering::SeqCst) && session.state() == SessionState::Running {
        std::thread::sleep(Duration::from_millis(100));
    }

    session.stop()?;
    let samples = session.get_results();
    match session.failure() {
        Some(e) if samples.is_empty() => Err(e),
        Some(e) => {
            warn!("Sampling ended early: {}", e);
            Ok(samples)
        }
        None => Ok(samples),
    }
}

fn run(args: Args) -> Result<(), String> {
    let registry = Arc::new(MetricRegistry::nvidia().map_err(|e| e.to_string())?);

    if args.list_metrics {
        print!("{}", format_metric_table(&registry));
        return Ok(());
    }

    let timeout = (args.timeout > 0).then(|| Duration::from_secs(args.timeout));
    let executor = NvidiaSmi::new(
        NvidiaSmiConfig::default()
            .with_binary(&args.smi_path)
            .with_timeout(timeout),
    );
    let engine = Arc::new(QueryEngine::with_executor(registry.clone(), Arc::new(executor)));

    let devices = if args.devices.is_empty() {
        engine.list_devices().map_err(|e| e.to_string())?
    } else {
        args.devices.clone()
    };
    debug!(?devices, "devices selected");

    if args.list_devices {
        for device in &devices {
            println!("{}", device);
        }
        return Ok(());
    }

    if args.static_info {
        let mut info = std::collections::BTreeMap::<u32, StaticInfo>::new();
        for device in &devices {
            let record = engine.get_static_info(*device).map_err(|e| e.to_string())?;
            info.insert(*device, (*record).clone());
        }
        return print_json(&info);
    }

    let period = seconds(args.interval, "interval")?;
    let metrics: Vec<String> = if args.metrics.is_empty() {
        registry
            .dynamic_ids()
            .into_iter()
            .map(str::to_string)
            .collect()
    } else {
        args.metrics.clone()
    };
    let config = SamplerConfig::new(period, devices, metrics);

    info!("gpustat {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: interval={}s, devices={:?}, metrics={}",
        args.interval,
        config.devices,
        config.metrics.join(",")
    );

    let total = args
        .duration
        .map(|total| seconds(total, "duration"))
        .transpose()?;
    let samples = match total {
        Some(total) => collect_for(&engine, &config, total),
        None => sample_until_interrupted(engine.clone(), config),
    }
    .map_err(|e| e.to_string())?;

    info!("Collected {}", describe_samples(&samples));
    print_json(&ColumnarSamples::from_samples(&samples))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
