//! stagecraft - run and inspect the generation scheduler.

mod logging;
mod simulated;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stagecraft_core::config::StagecraftConfig;
use stagecraft_core::domain::{
    ProjectId, SchedulerEvent, StageOptions, StageType, TaskId, TaskRecord,
};
use stagecraft_core::impls::SqliteTaskStore;
use stagecraft_core::ports::{StaticLimits, TaskStore};
use stagecraft_core::{Scheduler, SchedulerBuilder};
use tokio::sync::broadcast::error::RecvError;

use crate::simulated::SimulatedStage;

#[derive(Parser)]
#[command(name = "stagecraft")]
#[command(about = "Dependency-aware task scheduler for multi-stage content generation", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "stagecraft.toml")]
    config: PathBuf,

    /// Database path (overrides `[store] path`)
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler with simulated stages until every task is finished
    Run {
        /// Projects to submit before starting
        #[arg(short, long = "project", default_values_t = ["demo-1".to_string(), "demo-2".to_string()])]
        projects: Vec<String>,

        /// Skip the prompts/images pair
        #[arg(long)]
        no_images: bool,

        /// Skip the audio/subtitles pair
        #[arg(long)]
        no_audio: bool,

        /// Delay of each of the four progress steps of a simulated stage
        #[arg(long, default_value_t = 250)]
        step_delay_ms: u64,

        /// Transient failures each stage produces before succeeding
        #[arg(long, default_value_t = 0)]
        failures: u32,
    },
    /// Show task counts per status
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the tasks of a project
    Tasks {
        project: String,
    },
    /// Put a completed, failed or cancelled task back to pending (not one that is running)
    Retry {
        task: String,
    },
    /// Reset every processing task to pending (only while no scheduler runs)
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = StagecraftConfig::load(&cli.config)?;
    if let Some(database) = cli.database {
        config.store.path = database;
    }
    logging::init_logging(&config.logging)?;

    let store = Arc::new(
        SqliteTaskStore::open(config.store.database_config())
            .with_context(|| format!("open database {}", config.store.path.display()))?,
    );

    match cli.command {
        Commands::Run {
            projects,
            no_images,
            no_audio,
            step_delay_ms,
            failures,
        } => {
            let options = StageOptions {
                images: !no_images,
                audio: !no_audio,
            };
            let mut builder = SchedulerBuilder::new(store)
                .limits(Arc::new(StaticLimits(config.scheduler.limits())))
                .settings(config.scheduler.settings())
                .expect_stages(&StageType::ALL);
            for stage in StageType::ALL {
                builder = builder.register(
                    stage,
                    SimulatedStage::new(Duration::from_millis(step_delay_ms), failures),
                )?;
            }
            run(builder.build()?, projects, options).await
        }
        Commands::Stats { json } => {
            let stats = SchedulerBuilder::new(store).build()?.get_stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let counts = stats.counts;
                println!(
                    "pending={} processing={} completed={} failed={} cancelled={} total={}",
                    counts.pending,
                    counts.processing,
                    counts.completed,
                    counts.failed,
                    counts.cancelled,
                    counts.total()
                );
            }
            Ok(())
        }
        Commands::Tasks { project } => {
            let tasks = store.list_by_project(&ProjectId::new(project)).await?;
            for task in tasks {
                println!(
                    "{} {:<9} {:<10} p={:<3} attempts={}/{} progress={}%{}",
                    task.id,
                    task.stage,
                    task.status,
                    task.priority,
                    task.attempts,
                    task.max_attempts,
                    task.progress.percent,
                    error_column(&task)
                );
            }
            Ok(())
        }
        Commands::Retry { task } => {
            let id = TaskId::parse(&task)?;
            let record = SchedulerBuilder::new(store).build()?.retry_task(id).await?;
            println!("{} is pending again (attempts so far: {})", record.id, record.attempts);
            Ok(())
        }
        Commands::Recover => {
            let reset = store.reset_all_processing().await?;
            println!("reset {} task(s) to pending", reset.len());
            for id in reset {
                println!("  {id}");
            }
            Ok(())
        }
    }
}

async fn run(scheduler: Scheduler, projects: Vec<String>, options: StageOptions) -> Result<()> {
    let mut events = scheduler.subscribe();
    scheduler.start().await?;
    for project in projects {
        scheduler.submit(ProjectId::new(project), options).await?;
    }

    let mut idle_check = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; in-flight tasks are recovered on next start");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = idle_check.tick() => {
                if scheduler.get_stats().await?.is_idle() {
                    break;
                }
            }
        }
    }

    scheduler.stop().await?;
    let stats = scheduler.get_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats.counts)?);
    Ok(())
}

fn error_column(task: &TaskRecord) -> String {
    match (&task.error, task.error_kind) {
        (Some(error), Some(kind)) => format!(" error[{kind}]={error:?}"),
        (Some(error), None) => format!(" error={error:?}"),
        (None, _) => String::new(),
    }
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TaskProgress { .. } => {
            tracing::debug!(event = %serde_json::to_string(event).unwrap_or_default(), "progress");
        }
        SchedulerEvent::QuotaExhausted { .. } => {
            tracing::error!(event = %serde_json::to_string(event).unwrap_or_default(), "quota exhausted");
        }
        _ => {
            tracing::info!(event = %serde_json::to_string(event).unwrap_or_default(), "scheduler event");
        }
    }
}
