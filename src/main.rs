//! jobspawn - elastic worker-process pool for file-analysis jobs.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::info;

use jobspawn::logging::{self, LogConfig, SeverityTracker};
use jobspawn::registry::{TaskRegistry, builtin};
use jobspawn::spawner::{
    self, ErrorLevel, JobMeta, SpawnerConfig, install_signal_handlers, run_worker,
};

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Worker => cmd_worker(&cli),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Build the task registry this binary ships.
///
/// Embedders registering their own analysis callables would add them here.
fn build_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    builtin::register_all(&mut registry);
    registry
}

fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::new();
    if let Some(level) = logging::parse_level(&cli.log_level) {
        config.level = level;
    } else {
        eprintln!(
            "Warning: unknown log level '{}', using default",
            cli.log_level
        );
    }
    if let Ok(format) = cli.log_format.parse() {
        config.format = format;
    }
    config.file_path = cli.log_file.clone();
    config.with_env_overrides()
}

/// Worker mode: serve jobs over stdin/stdout until told to terminate.
fn cmd_worker(cli: &Cli) -> Result<()> {
    logging::init(log_config(cli), None);
    let registry = build_registry();
    run_worker(&registry)
}

/// Run the orchestrator, submit the given files, and drain.
fn cmd_run(cli: &Cli, args: &cli::RunArgs) -> Result<()> {
    let severity = SeverityTracker::new();
    let _guard = logging::init(log_config(cli), Some(&severity));

    let config = SpawnerConfig {
        workers: args.workers,
        max_in_flight: args.max_in_flight,
        default_meta: JobMeta::new(args.module.clone(), args.function.clone(), args.params.clone()),
        post_meta: JobMeta::new(args.post_module.clone(), args.post_function.clone(), args.post_params.clone()),
        severity: Arc::clone(&severity),
        ..Default::default()
    };

    let (handle, join) = spawner::spawn(config)?;
    install_signal_handlers(handle.shutdown_flag())?;

    info!("Submitting {} files for processing", args.files.len());
    for file in &args.files {
        if handle.shutdown_flag().is_triggered() {
            break;
        }
        handle.submit(file.clone());
        if args.submit_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(args.submit_delay_ms));
        }
    }

    // Drain everything submitted, then leave
    handle.stop();
    join.join()
        .map_err(|_| anyhow::anyhow!("control loop panicked"))??;

    let state = handle.state();
    let errors = handle.error_count();
    if errors > 0 || state.error == ErrorLevel::Error {
        info!(errors, "Finished with errors; see the log for details");
    } else {
        info!("Finished");
    }
    Ok(())
}
