//! tideflow command-line interface.
//!
//! Usage:
//!   tideflow config init <path>      Write default settings to a YAML file
//!   tideflow config check <path>     Load and validate a settings file
//!   tideflow schedule next <expr>    Print the next fire times of a cron expression
//!   tideflow demo [--watch]          Build the demo DAG and run it

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tideflow::{
    BashOperator, Dag, FnOperator, InMemoryStorage, RunId, Schedule, Scheduler, Settings, State,
    run_dag,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// tideflow - a minimal workflow orchestrator
#[derive(Parser)]
#[command(name = "tideflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage settings files
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Inspect cron expressions
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },

    /// Build the demo DAG, print its tree and run it
    Demo {
        /// Settings file (defaults are used when omitted)
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Keep running under the scheduler until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default settings
    Init {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Load and validate a settings file
    Check {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Print upcoming fire times
    Next {
        /// Cron expression (5 or 6 fields, or a shortcut such as @daily)
        #[arg(value_name = "EXPR")]
        expression: String,

        /// Number of fire times to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,

        /// Timezone the expression is interpreted in
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommand::Init { path, force } => init_config(path, force)?,
            ConfigCommand::Check { path } => check_config(path)?,
        },
        Commands::Schedule { command } => match command {
            ScheduleCommand::Next {
                expression,
                count,
                timezone,
            } => print_upcoming(&expression, &timezone, count)?,
        },
        Commands::Demo { config, watch } => run_demo(config, watch).await?,
    }

    Ok(())
}

fn init_config(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    Settings::default().write(&path)?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    let settings = Settings::load(&path)
        .with_context(|| format!("invalid settings file {}", path.display()))?;
    println!("{}: OK", path.display());
    println!("  parallelism:      {}", settings.core.parallelism);
    println!("  dag_concurrency:  {}", settings.core.dag_concurrency);
    println!("  default_timezone: {}", settings.core.default_timezone);
    println!("  heartbeat:        {}s", settings.scheduler.heartbeat_secs);
    println!("  shutdown_timeout: {}s", settings.scheduler.shutdown_timeout_secs);
    Ok(())
}

fn print_upcoming(expression: &str, timezone: &str, count: usize) -> Result<()> {
    let schedule = Schedule::with_timezone(expression, timezone)?;
    println!("{}", schedule);
    for at in schedule.upcoming(chrono::Utc::now(), count) {
        println!("  {}", at.to_rfc3339());
    }
    Ok(())
}

/// The demo DAG: print_date feeds sleep and hello, hello feeds hello2,
/// which feeds an in-process closure.
fn demo_dag() -> Result<Dag> {
    let schedule = Schedule::new("* * * * *")?;
    let mut dag = Dag::new("demo")
        .with_description("a demo of how a DAG runs")
        .with_schedule(schedule);

    let print_date = dag.add_task(BashOperator::new("print_date", "date"))?;
    let sleep = dag.add_task(BashOperator::builder("sleep", "sleep 1").retries(3).build())?;
    let hello = dag.add_task(BashOperator::new("hello", "echo hello world"))?;
    let hello2 = dag.add_task(BashOperator::new("hello2", "echo hello world"))?;
    let closure = dag.add_task(FnOperator::new("closure", || async {
        println!("hello from a closure!");
        Ok(())
    }))?;

    dag.set_upstream(&sleep, &print_date)?;
    dag.set_upstream(&hello, &print_date)?;
    dag.set_upstream(&hello2, &hello)?;
    dag.set_upstream(&closure, &hello2)?;
    Ok(dag)
}

async fn run_demo(config: Option<PathBuf>, watch: bool) -> Result<()> {
    let settings = match config {
        Some(path) => Settings::load(&path)
            .with_context(|| format!("invalid settings file {}", path.display()))?,
        None => Settings::default(),
    };
    let dag = demo_dag()?;
    print!("{}", dag.tree_view());

    if watch {
        let mut scheduler = Scheduler::new(InMemoryStorage::new(), settings)?;
        scheduler.add_dag(dag).await?;
        info!("Press Ctrl+C to stop");
        scheduler.run().await?;
        info!("Goodbye!");
        return Ok(());
    }

    let summary = run_dag(
        Arc::new(InMemoryStorage::new()),
        Arc::new(dag),
        RunId::new(),
        settings.core.parallelism,
        CancellationToken::new(),
    )
    .await?;

    for task_id in &summary.failed {
        warn!(task = %task_id, "task failed");
    }
    println!(
        "run {} finished {} in {:?}: {} succeeded, {} failed, {} upstream failed",
        summary.run_id,
        summary.state,
        summary.duration,
        summary.success.len(),
        summary.failed.len(),
        summary.upstream_failed.len()
    );
    if summary.state != State::Success {
        bail!("demo run did not succeed");
    }
    Ok(())
}
