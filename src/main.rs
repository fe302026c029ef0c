//! ArmorCode Release Gate CLI
//!
//! - `check`: run one gate invocation for a pipeline step
//! - `discover`: one discovery scan (or a dry run)
//! - `daemon`: scheduled discovery with settings hot-reload
//! - `ping` / `validate`: operator checks

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use release_gate::api::ApiClient;
use release_gate::config::{GateParams, IssueLevel, Settings, SettingsStore};
use release_gate::discovery::{
    BatchDispatcher, DiscoveryScheduler, DiscoveryService, FsJobHost, HttpBatchSink, JobScanner,
};
use release_gate::gate::{
    BuildIdentity, ConsoleInvocation, GateError, GateResult, GateStateMachine, HttpGateClient, InvocationContext,
    Mode, RunDirInvocation, SubProductsInput,
};
use release_gate::utils::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[clap(
    name = "release-gate",
    version = env!("CARGO_PKG_VERSION"),
    about = "ArmorCode release gate and pipeline discovery"
)]
struct Cli {
    /// Settings file (JSON). Environment variables override it.
    #[clap(long, global = true, env = "ARMORCODE_SETTINGS")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the release gate for one build
    Check(CheckArgs),
    /// Scan jobs once and report them
    Discover(DiscoverArgs),
    /// Run discovery on its schedule until interrupted
    Daemon(DaemonArgs),
    /// Check connectivity to ArmorCode
    Ping,
    /// Validate the settings
    Validate,
}

#[derive(clap::Args, Debug)]
struct CheckArgs {
    /// ArmorCode product (group)
    #[clap(long, env = "ARMORCODE_PRODUCT")]
    product: Option<String>,
    /// Sub-products, one per line
    #[clap(long, env = "ARMORCODE_SUB_PRODUCTS")]
    sub_products: Option<String>,
    /// A single sub-product; repeatable
    #[clap(long = "sub-product")]
    sub_product: Vec<String>,
    /// Environment name
    #[clap(long, env = "ARMORCODE_ENV")]
    env: Option<String>,
    /// 'block' or 'warn'
    #[clap(long, default_value = "block")]
    mode: String,
    /// Attempts before giving up (non-positive means 5)
    #[clap(long, default_value_t = 5, allow_negative_numbers = true)]
    max_retries: i64,
    /// Seconds between attempts
    #[clap(long, default_value_t = 20)]
    retry_delay: u64,
    /// Seconds to pause after the verdict
    #[clap(long)]
    settle_delay: Option<u64>,
    /// Overrides the configured base URL for this invocation
    #[clap(long)]
    target_url: Option<String>,
    #[clap(long, env = "BUILD_NUMBER", default_value = "0")]
    build_number: String,
    #[clap(long, env = "JOB_NAME", default_value = "")]
    job_name: String,
    #[clap(long, env = "JOB_URL", default_value = "")]
    job_url: String,
    /// Build directory for the log, parameters and marker file
    #[clap(long)]
    run_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct DiscoverArgs {
    /// Print the records as JSON instead of sending them
    #[clap(long)]
    dry_run: bool,
    /// Scan even when monitoring is disabled in the settings
    #[clap(long)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct DaemonArgs {
    /// Run one scan immediately
    #[clap(long)]
    scan_on_start: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let _telemetry = match init_telemetry(&TelemetryConfig::from_env("release-gate")) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Telemetry disabled: {:#}", e);
            None
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            on_interrupt.cancel();
        }
    });

    let result = match cli.command {
        Command::Check(args) => check(cli.config.as_deref(), args, cancel).await,
        Command::Discover(args) => discover(cli.config.as_deref(), args, cancel).await,
        Command::Daemon(args) => daemon(cli.config, args, cancel).await,
        Command::Ping => ping(cli.config.as_deref()).await,
        Command::Validate => validate(cli.config.as_deref()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("ERROR: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn check(config: Option<&Path>, args: CheckArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let settings = Settings::load(config)?;

    let sub_products = if args.sub_product.is_empty() {
        SubProductsInput::from(args.sub_products)
    } else {
        SubProductsInput::List(args.sub_product)
    };

    let params = GateParams {
        product: args.product.unwrap_or_default(),
        sub_products: sub_products.materialize(),
        sub_products_text: Some(sub_products.recorded_text()),
        environment: args.env.unwrap_or_default(),
        mode: Mode::parse(Some(args.mode.as_str())),
        max_retries: args.max_retries,
        retry_delay: Duration::from_secs(args.retry_delay),
        settle_delay: args.settle_delay.map(Duration::from_secs),
        target_url: args.target_url,
        build: BuildIdentity { build_number: args.build_number, job_name: args.job_name, job_url: args.job_url },
    };

    let invocation: Box<dyn InvocationContext> = match args.run_dir {
        Some(dir) => Box::new(RunDirInvocation::new(dir)?),
        None => Box::new(ConsoleInvocation),
    };

    let client = HttpGateClient::new(&params.resolve_base_url(&settings));
    info!("Polling {}", client.endpoint());
    let machine = GateStateMachine::with_cancellation(Arc::new(client), cancel);

    match machine.run(&params, settings.token().unwrap_or_default(), invocation.as_ref()).await {
        Ok(outcome) => Ok(match outcome.result {
            GateResult::Pass | GateResult::Degraded => ExitCode::SUCCESS,
            GateResult::Fail => {
                eprintln!("ArmorCode release gate failed: Security check did not pass");
                ExitCode::from(1)
            }
        }),
        Err(e @ GateError::Exhausted { .. }) => {
            invocation.console(&format!("{}", e));
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn build_service(settings_store: SettingsStore, settings: &Settings, cancel: CancellationToken) -> Result<DiscoveryService> {
    let jobs_dir = settings
        .jobs_dir
        .clone()
        .context("No jobs directory configured (jobsDir / ARMORCODE_JOBS_DIR)")?;
    let host = FsJobHost::new(jobs_dir, settings.root_url.clone());
    let scanner = Arc::new(JobScanner::new(Arc::new(host)));
    let dispatcher = BatchDispatcher::new(Arc::new(HttpBatchSink::new(ApiClient::new()))).with_cancellation(cancel);
    Ok(DiscoveryService::new(scanner, dispatcher, settings_store))
}

async fn discover(config: Option<&Path>, args: DiscoverArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let mut settings = Settings::load(config)?;
    if args.force {
        settings.monitor_builds = true;
    }
    let service = build_service(SettingsStore::new(settings.clone()), &settings, cancel)?;

    if args.dry_run {
        let records = service.collect(&settings).await?;
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }

    let report = service.run_scan(&settings).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(match report {
        release_gate::discovery::ScanReport::Failed { .. } => ExitCode::from(1),
        release_gate::discovery::ScanReport::Sent(result) if !result.is_success() => ExitCode::from(1),
        _ => ExitCode::SUCCESS,
    })
}

async fn daemon(config: Option<PathBuf>, args: DaemonArgs, cancel: CancellationToken) -> Result<ExitCode> {
    let store = SettingsStore::open(config)?;
    let settings = store.snapshot().await;
    let service = Arc::new(build_service(store.clone(), &settings, cancel.clone())?);
    let scheduler = Arc::new(DiscoveryScheduler::new(store.clone(), service));

    scheduler.reschedule(&settings.schedule()).await;
    if args.scan_on_start {
        scheduler.run_now().await;
    }

    // Bridge the sync watcher into the async loop
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(16);
    let _watcher = match store.path() {
        Some(path) => Some(watch_settings(path, tx)?),
        None => None,
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(event) = rx.recv() => {
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    continue;
                }
                // Editors often write in bursts
                tokio::time::sleep(Duration::from_millis(200)).await;
                while rx.try_recv().is_ok() {}

                match store.reload_from_file().await {
                    Ok(settings) => {
                        info!("Settings changed, rescheduling discovery");
                        scheduler.reschedule(&settings.schedule()).await;
                    }
                    Err(e) => warn!("Ignoring settings change: {}", e),
                }
            }
        }
    }

    scheduler.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

fn watch_settings(path: &Path, tx: tokio::sync::mpsc::Sender<Event>) -> Result<RecommendedWatcher> {
    let target = path.to_path_buf();
    let file_name = target.file_name().map(|n| n.to_os_string());
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name) {
                    let _ = tx.blocking_send(event);
                }
            }
        },
        notify::Config::default(),
    )?;

    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Watching {} for changes", target.display());
    Ok(watcher)
}

async fn ping(config: Option<&Path>) -> Result<ExitCode> {
    let settings = Settings::load(config)?;
    let api = ApiClient::new();
    match api.ping(&settings.base_url, settings.token()).await {
        Ok(true) => {
            println!("Connection successful!");
            Ok(ExitCode::SUCCESS)
        }
        Ok(false) => {
            println!("Connection failed: {} did not answer 200", settings.base_url);
            Ok(ExitCode::from(1))
        }
        Err(e) => {
            println!("Connection failed: {}", e);
            Ok(ExitCode::from(1))
        }
    }
}

fn validate(config: Option<&Path>) -> Result<ExitCode> {
    let settings = Settings::load(config)?;
    let issues = settings.validate();
    if issues.is_empty() {
        println!("Settings OK");
        return Ok(ExitCode::SUCCESS);
    }
    for issue in &issues {
        println!("[{:?}] {}: {}", issue.level, issue.field, issue.message);
    }
    Ok(if issues.iter().any(|i| i.level == IssueLevel::Error) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}
