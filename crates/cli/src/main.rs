//! Tasklane CLI - run demo workloads through a task service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tasklane_core::{
    AppConfig, BlockingScope, MapResources, ResourceMap, TaskError, TaskEventPayload, TaskState,
};
use tasklane_execution::{AppContext, Task, TaskContext};
use tasklane_progress::{MonitorEvent, TaskMonitor};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_RESOURCES: &str = "\
# Demo task resources
demo.title = Demo task {0}
demo.step = Step {0} of {1}
demo.done = Finished after {0} steps
";

#[derive(Parser)]
#[command(name = "tasklane")]
#[command(about = "Background task execution with a UI dispatch context", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run demo tasks and report their progress
    Run {
        /// Number of tasks to submit
        #[arg(long, default_value = "3")]
        tasks: usize,
        /// Steps per task
        #[arg(long, default_value = "5")]
        steps: u32,
        /// Sleep per step in milliseconds
        #[arg(long, default_value = "100")]
        step_ms: u64,
        /// Make every Nth task fail (0 = never)
        #[arg(long, default_value = "0")]
        fail_every: usize,
        /// Cancel the last task after this many milliseconds
        #[arg(long)]
        cancel_after_ms: Option<u64>,
        /// Block application input while tasks run
        #[arg(long)]
        block: bool,
        /// Resource file (key = value lines)
        #[arg(long)]
        resources: Option<PathBuf>,
    },
    /// Print the effective configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run {
            tasks,
            steps,
            step_ms,
            fail_every,
            cancel_after_ms,
            block,
            resources,
        } => {
            let resources = match resources {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    MapResources::from_properties(&text)
                }
                None => MapResources::from_properties(DEFAULT_RESOURCES),
            };
            let demo = Demo {
                tasks,
                steps,
                step: Duration::from_millis(step_ms),
                fail_every,
                cancel_after: cancel_after_ms.map(Duration::from_millis),
                block,
            };
            demo.run(config, resources).await?;
        }
    }

    Ok(())
}

struct Demo {
    tasks: usize,
    steps: u32,
    step: Duration,
    fail_every: usize,
    cancel_after: Option<Duration>,
    block: bool,
}

impl Demo {
    async fn run(&self, config: AppConfig, resources: MapResources) -> Result<()> {
        let resources = Arc::new(resources);
        let context = AppContext::builder()
            .config(config)
            .shared_resources(resources.clone())
            .start()?;

        let monitor = TaskMonitor::new(&context);
        monitor.subscribe(|event| match event {
            MonitorEvent::ForegroundChanged { new, .. } => {
                let title = new.as_ref().and_then(Task::title).unwrap_or_else(|| "-".to_string());
                println!("[foreground] {}", title);
            }
            MonitorEvent::Message { new: Some(message), .. } => println!("  {}", message),
            MonitorEvent::Progress { new: Some(percent), .. } => println!("  {:>3}%", percent),
            _ => {}
        });

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut submitted = Vec::new();
        for index in 1..=self.tasks {
            let task = self.build_task(&context, &resources, index);
            let tx = done_tx.clone();
            task.subscribe(move |event| {
                if matches!(event.payload, TaskEventPayload::Completed) {
                    let _ = tx.send(event.task_id);
                }
            });
            context.task_service().execute(&task)?;
            submitted.push(task);
        }
        drop(done_tx);

        if let (Some(delay), Some(last)) = (self.cancel_after, submitted.last().cloned()) {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if last.cancel(true) {
                    info!("Cancelled task {}", last.id());
                }
            });
        }

        let mut remaining = submitted.len();
        while remaining > 0 {
            if done_rx.recv().await.is_none() {
                break;
            }
            remaining -= 1;
        }

        println!();
        println!("Summary");
        for task in &submitted {
            let outcome = task.outcome().map(|s| s.to_string()).unwrap_or_else(|| "?".to_string());
            let duration = task
                .execution_duration()
                .map(|d| format!("{}ms", d.num_milliseconds()))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} | {:<11} | {:>7} | {}",
                task.id(),
                outcome,
                duration,
                task.title().unwrap_or_default()
            );
        }
        let failed = submitted
            .iter()
            .filter(|t| t.outcome() == Some(TaskState::Failed))
            .count();

        monitor.close();
        if !context.shutdown(Duration::from_secs(5)).await {
            warn!("Some workers did not stop in time");
        }
        if failed > 0 {
            warn!("{} task(s) failed", failed);
        }
        Ok(())
    }

    fn build_task(&self, context: &AppContext, resources: &MapResources, index: usize) -> Task {
        let steps = self.steps;
        let step = self.step;
        let fail = self.fail_every > 0 && index % self.fail_every == 0;
        let title = resources
            .get_string("demo.title")
            .map(|t| tasklane_core::format_message(&t, &[&index]))
            .unwrap_or_else(|| format!("Demo task {}", index));

        let mut builder = context
            .task(move |cx: TaskContext| async move {
                for n in 1..=steps {
                    if cx.is_cancelled() {
                        break;
                    }
                    if let Err(e) = cx.message("step", &[&n, &steps]).await {
                        warn!("Task {} step message unavailable: {}", cx.task().id(), e);
                    }
                    cx.sleep(step).await?;
                    if let Err(e) = cx.set_progress_range(n as f64, 0.0, steps as f64).await {
                        warn!("Task {} progress not updated: {}", cx.task().id(), e);
                    }
                }
                if fail {
                    return Err(TaskError::msg("simulated failure"));
                }
                Ok(steps)
            })
            .resource_prefix("demo")
            .title(title)
            .on_succeeded(|task, steps| {
                if task.set_resource_message("done", &[&steps]).is_err() {
                    task.set_message(format!("Finished after {} steps", steps));
                }
            })
            .on_failed(|task, err| task.set_message(format!("Failed: {}", err)));
        if self.block {
            builder = builder.block(BlockingScope::Application, None);
        }
        builder.build()
    }
}
