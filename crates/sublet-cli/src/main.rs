//! `sublet`: launches demo works in worker subprocesses.
//!
//! The same binary is the worker: started with the worker argv tail it runs
//! the bootstrap instead of the CLI.

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use sublet::{ConsoleTerminal, RunnerOptions, WorkerArgs, logging};
use sublet_cli::works;

#[derive(Parser, Debug)]
#[command(name = "sublet")]
#[command(version)]
#[command(about = "Run units of work in isolated worker subprocesses")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one work in a fresh worker process
    Run {
        /// Work identity, see `sublet list`
        work: String,

        /// Work configuration as JSON
        #[arg(short, long, default_value = "{}")]
        config: String,

        /// Extra argument for the worker process, e.g. `--inspect`
        #[arg(long = "runtime-arg", allow_hyphen_values = true)]
        runtime_args: Vec<String>,

        /// Show verbose terminal output, including worker info logs
        #[arg(short, long)]
        verbose: bool,
    },
    /// List the works this binary can run
    List,
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")
}

/// Worker mode. The runtime must not wait for blocking tasks on the way out:
/// tokio's stdin reader may still sit in an uncancellable `read` on the parent
/// pipe after the exit message went out.
fn run_worker_process(args: WorkerArgs) -> anyhow::Result<()> {
    logging::init_worker_tracing();
    let rt = runtime()?;
    let result = rt.block_on(works::registry().run(args));
    rt.shutdown_background();
    result.context("failed to deliver exit message")
}

fn main() -> anyhow::Result<()> {
    if let Some(args) = WorkerArgs::from_env() {
        return run_worker_process(args);
    }

    let cli = Cli::parse();
    logging::init_tracing();

    match cli.command {
        Command::List => {
            for identity in works::registry().identities() {
                println!("{identity}");
            }
            Ok(())
        }
        Command::Run {
            work,
            config,
            runtime_args,
            verbose,
        } => {
            let terminal = Arc::new(ConsoleTerminal::new().with_verbose(verbose));
            let mut options = RunnerOptions::from_env().context("failed to locate executable")?;
            options.runtime_args.extend(runtime_args);
            tracing::debug!(%work, runtime_args = ?options.runtime_args, "Launching work");
            runtime()?.block_on(works::launch(&work, &config, terminal, options))
        }
    }
}
