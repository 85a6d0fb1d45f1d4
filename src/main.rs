use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::{non_blocking::WorkerGuard, rolling::RollingFileAppender};
use tracing_subscriber::EnvFilter;
use worker_supervisor::{
    Config, ExecRuntime, PidFile, ProcessLifecycle, SignalRelay, SupervisorBuilder,
};

/// Keeps a pool of queue worker processes alive.
#[derive(Debug, Parser)]
#[command(name = "worker-supervisor", version, about)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long)]
    config: PathBuf,
    /// Number of worker processes, overrides `concurrency` from the file.
    #[arg(long)]
    concurrency: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (config, runtime) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("worker-supervisor: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("worker-supervisor: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, runtime) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "supervisor aborted");
            ExitCode::FAILURE
        }
    }
}

/// The binary has no job loop of its own, so a worker command is required.
fn load_config(cli: &Cli) -> anyhow::Result<(Config, ExecRuntime)> {
    let mut config = Config::load(&cli.config)?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    let runtime = config.exec_runtime()?;
    Ok((config, runtime))
}

/// The returned guard flushes the log file on drop.
fn init_logging(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log_level {:?}", config.log_level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let Some(path) = &config.log_file else {
        builder.with_writer(std::io::stderr).init();
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .with_context(|| format!("log_file {} has no file name", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut appender = RollingFileAppender::builder()
        .rotation(config.log_rotation.into())
        .filename_prefix(file_name.to_string_lossy());
    if let Some(max_files) = config.log_max_files {
        appender = appender.max_log_files(max_files);
    }
    let appender = appender
        .build(directory)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    builder.with_ansi(false).with_writer(writer).init();
    Ok(Some(guard))
}

fn run(config: Config, runtime: ExecRuntime) -> anyhow::Result<()> {
    let _pid_file = config
        .pid_file
        .as_ref()
        .map(PidFile::create)
        .transpose()
        .context("failed to write pid file")?;

    // Workers are forked from this runtime, keep it to a single thread.
    let tokio_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    tokio_runtime.block_on(async {
        let mut relay = SignalRelay::new();
        relay
            .install_signal_handlers()
            .context("failed to install signal handlers")?;
        relay.spawn_reaper().context("failed to start reaper")?;

        let lifecycle = ProcessLifecycle::new(config.worker_spec(), runtime)
            .with_hooks(config.hooks.clone());
        info!(
            version = env!("CARGO_PKG_VERSION"),
            workers = config.concurrency,
            queues = %config.queues.join(","),
            "worker-supervisor starting"
        );

        SupervisorBuilder::from_config(&config)
            .build()
            .run(relay, lifecycle)
            .wait()
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}
