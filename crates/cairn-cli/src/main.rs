//! cairn - drives the task execution core from a terminal

mod commands;
mod config;
mod host;
mod replay;
mod tools;
mod utils;

use cairn_agent::TaskHistoryStore;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// cairn - AI coding agent execution core
#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Create a config file at the default location and exit
    #[arg(long)]
    init_config: bool,

    /// Working directory
    #[arg(short, long, global = true)]
    working_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a task against a recorded chunk stream
    Replay {
        /// JSON file of recorded turns
        chunks: PathBuf,

        /// Prompt for a new task
        #[arg(long, required_unless_present = "resume", conflicts_with = "resume")]
        task: Option<String>,

        /// Resume a saved task by id instead
        #[arg(long)]
        resume: Option<String>,

        /// Answer every question without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect and repair the task history
    History {
        #[command(subcommand)]
        command: commands::HistoryCommand,
    },

    /// Find and try out lifecycle hooks
    Hooks {
        #[command(subcommand)]
        command: commands::HooksCommand,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "cairn=debug,cairn_agent=debug,cairn_api=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let cfg = config::Config::load();
    let cwd = match args.working_dir {
        Some(dir) => dir.canonicalize()?,
        None => std::env::current_dir()?,
    };
    tracing::debug!(cwd = %cwd.display(), data_dir = %cfg.data_dir().display(), "starting");

    match command {
        Command::Replay {
            chunks,
            task,
            resume,
            yes,
        } => {
            let opts = commands::ReplayOptions {
                chunks,
                task,
                resume,
                yes,
            };
            commands::replay::run(&cfg, &cwd, opts).await
        }
        Command::History { command } => {
            let store = Arc::new(TaskHistoryStore::new(cfg.data_dir()));
            commands::history::run(store, command)
        }
        Command::Hooks { command } => commands::hooks::run(&cfg, &cwd, command).await,
    }
}
