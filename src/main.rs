// converge CLI - run plays against the local machine

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use converge::executor::{run_adhoc_task, Config, Environment, Runner};
use converge::modules::CommandRegistry;
use converge::output::{reporter_for, OutputFormat, Recap};
use converge::parser::parse_plays_file;

#[derive(Parser)]
#[command(
    name = "converge",
    about = "Run declarative plays: ordered tasks, futures, async actions and handlers",
    version,
    disable_colored_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output and debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Run a play file
    Run {
        /// Path to the play file
        playbook: PathBuf,

        /// Path to a YAML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        output: OutputFormat,

        /// Echo each process invocation and its output
        #[arg(long)]
        show_output: bool,
    },

    /// Check that a play file parses
    Validate {
        /// Path to the play file
        playbook: PathBuf,
    },

    /// Run a single builtin command
    Adhoc {
        /// Builtin name (command, shell, copy, script)
        command: String,

        /// Argument text handed to the command
        #[arg(default_value = "")]
        args: String,
    },
}

/// Exit code when the run finished but some task failed
const EXIT_TASK_FAILED: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            playbook,
            config,
            output,
            show_output,
        } => run_playbook(playbook, config, output, show_output, cli.verbose).await,
        Commands::Validate { playbook } => validate_playbook(playbook),
        Commands::Adhoc { command, args } => run_adhoc(&command, &args).await,
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(EXIT_TASK_FAILED),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether every task succeeded
async fn run_playbook(
    playbook: PathBuf,
    config_path: Option<PathBuf>,
    output: OutputFormat,
    show_output: bool,
    verbose: bool,
) -> anyhow::Result<bool> {
    let mut config = match &config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if show_output {
        config.show_command_output = true;
    }

    let plays = parse_plays_file(&playbook)
        .with_context(|| format!("loading plays from {}", playbook.display()))?;

    let env = Environment::new(config, Arc::new(CommandRegistry::with_builtins()))
        .with_reporter(reporter_for(output, verbose));

    let mut runner = Runner::new(Arc::new(env), plays);
    runner.run().await.context("run aborted")?;

    let recap = Recap::from_history(&runner.results());
    Ok(recap.failed == 0)
}

fn validate_playbook(playbook: PathBuf) -> anyhow::Result<bool> {
    println!("{} {}", "Validating:".cyan(), playbook.display());

    let plays = parse_plays_file(&playbook)?;

    println!("{} Play file is valid", "✓".green());
    for play in &plays {
        println!();
        println!("  {} {}", "Play:".dimmed(), play.name);
        println!("  {} {}", "Tasks:".dimmed(), play.tasks.len());
        println!("  {} {}", "Handlers:".dimmed(), play.handlers.len());
        println!("  {} {}", "Modules:".dimmed(), play.modules.len());
    }

    Ok(true)
}

async fn run_adhoc(command: &str, args: &str) -> anyhow::Result<bool> {
    let output = run_adhoc_task(command, args).await?;

    let json = serde_json::to_string_pretty(&output.to_value())?;
    println!("{}", json);

    Ok(!output.failed())
}
