use anyhow::{Context, Result};
use clap::Parser;
use relaytest_common::{ProxyConfig, TesterConfig};
use relaytest_metrics::{sampler, server, Metrics};
use relaytest_tester::{BatchDriver, DriverOutcome, ShutdownSupervisor, Tester};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Concurrent proxy candidate tester.
///
/// Reads a JSON array of normalized candidate records, tests each one
/// through a freshly launched proxy core, and writes per-batch result
/// files under the data directory.
#[derive(Parser, Debug)]
#[command(name = "relaytest", version, about, long_about = None)]
struct Args {
    /// Candidate list (JSON array of proxy records)
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    initialize_logging(args.debug);

    match run(args).await {
        Ok(DriverOutcome::Completed) => {}
        Ok(DriverOutcome::Interrupted) => std::process::exit(130),
        Err(e) => {
            error!("fatal: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<DriverOutcome> {
    let config = TesterConfig::from_env().context("reading environment")?;
    config.validate().context("validating configuration")?;

    ensure_directories(&config).context("creating working directories")?;

    let raw = std::fs::read_to_string(&args.input)
        .with_context(|| format!("reading candidate list {}", args.input.display()))?;
    let candidates: Vec<ProxyConfig> =
        serde_json::from_str(&raw).context("parsing candidate list")?;
    info!(
        candidates = candidates.len(),
        core = %config.xray_path.display(),
        workers = config.max_workers,
        "relaytest starting"
    );

    let metrics = Arc::new(Metrics::new());
    let supervisor = ShutdownSupervisor::new(config.graceful_timeout);
    let _signals = supervisor.install();

    let _sampler = sampler::spawn_memory_sampler(
        Arc::clone(&metrics),
        Some(config.max_memory_mb),
        supervisor.abort_token(),
    );
    if config.enable_metrics {
        let metrics = Arc::clone(&metrics);
        let port = config.metrics_port;
        let token = supervisor.abort_token();
        tokio::spawn(async move {
            if let Err(e) = server::serve(metrics, port, token).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }

    let tester =
        Tester::new(config, Arc::clone(&metrics))?.with_abort_token(supervisor.abort_token());
    let driver = BatchDriver::new(tester);

    let report = driver.run(&supervisor.batch_token(), candidates).await?;
    supervisor.finish();

    let snapshot = metrics.snapshot();
    let success_rate = format!("{:.1}%", snapshot.success_rate);
    let avg_response = format!("{:.3}s", snapshot.avg_response_time_seconds);
    info!(
        total = report.total,
        successful = report.successful,
        success_rate = %success_rate,
        avg_response = %avg_response,
        "run finished"
    );

    if supervisor.interrupted() {
        return Ok(DriverOutcome::Interrupted);
    }
    Ok(report.outcome)
}

fn ensure_directories(config: &TesterConfig) -> Result<()> {
    for dir in [
        config.data_dir.clone(),
        config.results_dir(),
        config.config_dir.clone(),
        config.log_dir.clone(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}
