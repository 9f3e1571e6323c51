//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Elastic worker-process pool for file-analysis jobs.
#[derive(Parser, Debug)]
#[command(name = "jobspawn")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "JOBSPAWN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty, compact, json.
    #[arg(long, env = "JOBSPAWN_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Also log to this file (rotated daily).
    #[arg(long, env = "JOBSPAWN_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process files through the worker pool.
    Run(RunArgs),

    /// Internal worker mode, spawned by the orchestrator.
    #[command(hide = true)]
    Worker,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Files to submit for processing.
    pub files: Vec<String>,

    /// Number of parallel worker processes.
    #[arg(short, long, default_value_t = 2)]
    pub workers: usize,

    /// Maximum number of jobs admitted in flight at a time.
    #[arg(long, default_value_t = 6)]
    pub max_in_flight: usize,

    /// Module of the processing task.
    #[arg(short, long, default_value = "builtin")]
    pub module: String,

    /// Function of the processing task.
    #[arg(short, long, default_value = "noop")]
    pub function: String,

    /// Parameter string passed to the processing task.
    #[arg(short, long, default_value = "")]
    pub params: String,

    /// Module of the post-processing task (empty disables post-processing).
    #[arg(long, default_value = "")]
    pub post_module: String,

    /// Function of the post-processing task.
    #[arg(long, default_value = "")]
    pub post_function: String,

    /// Parameter string passed to the post-processing task.
    #[arg(long, default_value = "")]
    pub post_params: String,

    /// Delay between submissions, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub submit_delay_ms: u64,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "jobspawn",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "jobspawn",
            "run",
            "--workers",
            "4",
            "--module",
            "builtin",
            "--function",
            "upper",
            "a.h5",
            "b.h5",
        ])
        .unwrap();

        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.workers, 4);
                assert_eq!(args.function, "upper");
                assert_eq!(args.files, vec!["a.h5", "b.h5"]);
                assert_eq!(args.max_in_flight, 6);
            }
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn test_cli_parses_worker() {
        let cli = Cli::try_parse_from(["jobspawn", "worker"]).unwrap();
        assert!(matches!(cli.command, Commands::Worker));
    }

    #[test]
    fn test_cli_verifies() {
        Cli::command().debug_assert();
    }
}
