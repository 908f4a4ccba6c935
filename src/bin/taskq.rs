//! taskq CLI: operator interface to the task queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio::process::Command as ProcessCommand;
use tracing::{debug, info};

use taskq::clock::SystemClock;
use taskq::config::Config;
use taskq::db::Db;
use taskq::engine::{ProcessorRegistry, QueueController, TaskProcessor, Worker, WorkerConfig};
use taskq::ids::RandomUuidFactory;
use taskq::model::{
    ActivityQuery, ActivityStatus, QueueFilter, Task, TaskId, TaskResult, TaskStatus, TaskSubmit,
};
use taskq::status::StatusCounters;
use taskq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "taskq", about = "Persistent background task queue")]
struct Cli {
    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run worker loops until interrupted
    Serve {
        /// Task handler as TYPE=COMMAND; repeatable
        #[arg(long = "handler", value_parser = parse_handler)]
        handlers: Vec<(String, PathBuf)>,
    },
    /// Submit a new task
    Submit {
        /// Task type (determines which handler runs it)
        task_type: String,
        /// Owning component key
        #[arg(long)]
        component: Option<String>,
        /// Submitter login
        #[arg(long)]
        submitter: Option<String>,
    },
    /// Inspect the live queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Cancel one task, pending or in progress
    Cancel {
        /// Task UUID
        id: TaskId,
    },
    /// Cancel every pending task
    CancelPending,
    /// Cancel every task, in-progress ones included
    Clear,
    /// Search archived outcomes
    Activity {
        /// Filter by status (repeatable)
        #[arg(long = "status")]
        statuses: Vec<ActivityStatus>,
        /// Filter by task type
        #[arg(long = "type")]
        task_type: Option<String>,
        /// Filter by component
        #[arg(long)]
        component: Option<String>,
        /// Components whose key contains this text, ignoring case
        #[arg(long)]
        component_query: Option<String>,
        /// Only the latest activity per task type and component
        #[arg(long)]
        only_currents: bool,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        page_size: usize,
    },
    /// Show queue depth and archive totals
    Status,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued tasks, oldest first
    List {
        /// Filter by status (pending, in_progress)
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Filter by task type
        #[arg(long = "type")]
        task_type: Option<String>,
        /// Filter by component
        #[arg(long)]
        component: Option<String>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a queued or archived task
    Show {
        /// Task UUID
        id: TaskId,
    },
}

fn parse_handler(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((task_type, command)) if !task_type.is_empty() && !command.is_empty() => {
            Ok((task_type.to_string(), PathBuf::from(command)))
        }
        _ => Err(format!("expected TYPE=COMMAND, got '{raw}'")),
    }
}

type Controller = QueueController<Db>;

async fn connect(config: &Config) -> anyhow::Result<Controller> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(QueueController::new(
        Arc::new(db),
        Arc::new(SystemClock),
        Arc::new(RandomUuidFactory),
        Arc::new(StatusCounters::new()),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Only the long-running server exports telemetry.
    let _guard = match cli.command {
        Command::Serve { .. } => Some(init_telemetry(TelemetryConfig {
            endpoint: config.otel_endpoint.clone(),
            service_name: "taskq".to_string(),
            log_level: config.log_level.clone(),
        })?),
        _ => None,
    };

    let controller = connect(&config).await?;
    let json = cli.json;
    match cli.command {
        Command::Serve { handlers } => cmd_serve(&controller, &config, handlers).await,
        Command::Submit {
            task_type,
            component,
            submitter,
        } => cmd_submit(&controller, task_type, component, submitter).await,
        Command::Queue { action } => match action {
            QueueAction::List {
                status,
                task_type,
                component,
                limit,
            } => {
                let filter = QueueFilter {
                    status,
                    task_type,
                    component_id: component,
                    limit,
                };
                cmd_queue_list(&controller, &filter, json).await
            }
            QueueAction::Show { id } => cmd_show(&controller, id, json).await,
        },
        Command::Cancel { id } => {
            if controller.cancel(id).await? {
                println!("Canceled: {id}");
            } else {
                println!("Task {id} is no longer queued.");
            }
            Ok(())
        }
        Command::CancelPending => {
            let count = controller.cancel_pending().await?;
            println!("Canceled {count} pending task(s).");
            Ok(())
        }
        Command::Clear => {
            let count = controller.clear().await?;
            println!("Canceled {count} task(s).");
            Ok(())
        }
        Command::Activity {
            statuses,
            task_type,
            component,
            component_query,
            only_currents,
            page,
            page_size,
        } => {
            let query = ActivityQuery {
                component_id: component,
                component_query,
                task_type,
                statuses,
                only_currents,
                page,
                page_size,
                ..Default::default()
            };
            cmd_activity(&controller, &query, json).await
        }
        Command::Status => cmd_status(&controller).await,
    }
}

async fn cmd_serve(
    controller: &Controller,
    config: &Config,
    handlers: Vec<(String, PathBuf)>,
) -> anyhow::Result<()> {
    let worker_ids = config.worker_ids();
    controller.recover(&worker_ids).await?;

    let mut registry = ProcessorRegistry::empty();
    for (task_type, command) in handlers {
        registry = registry.register(task_type, CommandProcessor { command });
    }
    let registry = Arc::new(registry);
    info!(
        task_types = ?registry.task_types().collect::<Vec<_>>(),
        instance = %config.instance_id,
        workers = config.workers,
        "starting workers"
    );

    let workers: Vec<Worker<Db>> = worker_ids
        .into_iter()
        .map(|worker_id| {
            Worker::new(
                controller.clone(),
                Arc::clone(&registry),
                WorkerConfig::new(worker_id).poll_interval(config.poll_interval),
            )
        })
        .collect();

    let stoppers = workers.clone();
    let signal_controller = controller.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal_controller.pause_peek();
        for worker in &stoppers {
            worker.shutdown();
        }
    });

    let handles: Vec<_> = workers
        .into_iter()
        .map(|worker| tokio::spawn(async move { worker.run().await }))
        .collect();
    for handle in handles {
        handle.await??;
    }
    Ok(())
}

/// Runs an external command per task. Exit status 0 is success; the first
/// line of stdout, if any, becomes the analysis reference.
struct CommandProcessor {
    command: PathBuf,
}

#[async_trait]
impl TaskProcessor for CommandProcessor {
    async fn process(&self, task: &Task) -> anyhow::Result<TaskResult> {
        debug!(command = %self.command.display(), task_id = %task.id, "running handler");
        let output = ProcessCommand::new(&self.command)
            .env("TASKQ_TASK_ID", task.id.to_string())
            .env("TASKQ_TASK_TYPE", &task.task_type)
            .env("TASKQ_COMPONENT", task.component_id.as_deref().unwrap_or(""))
            .env("TASKQ_ATTEMPT", task.execution_count.to_string())
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "handler exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(TaskResult {
            analysis_id: stdout
                .lines()
                .next()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        })
    }
}

async fn cmd_submit(
    controller: &Controller,
    task_type: String,
    component: Option<String>,
    submitter: Option<String>,
) -> anyhow::Result<()> {
    let mut submit = TaskSubmit::new(task_type);
    if let Some(component) = component {
        submit = submit.component(component);
    }
    if let Some(submitter) = submitter {
        submit = submit.submitter(submitter);
    }

    let task = controller.submit(submit).await?;
    println!("Submitted: {} ({})", task.id, task.task_type);
    Ok(())
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(chrono::DateTime::from_timestamp_millis)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn cmd_queue_list(
    controller: &Controller,
    filter: &QueueFilter,
    json: bool,
) -> anyhow::Result<()> {
    let tasks = controller.queue(filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No queued tasks.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<11}  {:<20}  {:<3}  SUBMITTED",
        "ID", "TYPE", "STATUS", "COMPONENT", "RUN"
    );
    println!("{}", "-".repeat(110));

    for task in &tasks {
        println!(
            "{:<36}  {:<12}  {:<11}  {:<20}  {:<3}  {}",
            task.id,
            task.task_type,
            task.status,
            task.component_id.as_deref().unwrap_or("-"),
            task.execution_count,
            format_ms(Some(task.submitted_at))
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_show(controller: &Controller, id: TaskId, json: bool) -> anyhow::Result<()> {
    if let Some(task) = controller.task(id).await? {
        if json {
            println!("{}", serde_json::to_string_pretty(&task)?);
            return Ok(());
        }
        println!("ID:         {}", task.id);
        println!("Type:       {}", task.task_type);
        println!("Status:     {}", task.status);
        println!("Component:  {}", task.component_id.as_deref().unwrap_or("-"));
        println!("Submitter:  {}", task.submitter.as_deref().unwrap_or("-"));
        println!("Submitted:  {}", format_ms(Some(task.submitted_at)));
        println!("Started:    {}", format_ms(task.started_at));
        println!("Worker:     {}", task.worker_id.as_deref().unwrap_or("-"));
        println!("Executions: {}", task.execution_count);
        return Ok(());
    }

    let Some(activity) = controller.activity(id).await? else {
        anyhow::bail!("no task or activity with id {id}");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&activity)?);
        return Ok(());
    }
    println!("ID:         {}", activity.id);
    println!("Type:       {}", activity.task_type);
    println!("Status:     {}", activity.status);
    println!("Component:  {}", activity.component_id.as_deref().unwrap_or("-"));
    println!("Submitter:  {}", activity.submitter.as_deref().unwrap_or("-"));
    println!("Submitted:  {}", format_ms(Some(activity.submitted_at)));
    println!("Started:    {}", format_ms(activity.started_at));
    println!("Executed:   {}", format_ms(activity.executed_at));
    if let Some(ms) = activity.execution_time_ms {
        println!("Duration:   {ms}ms");
    }
    println!("Worker:     {}", activity.worker_id.as_deref().unwrap_or("-"));
    println!("Executions: {}", activity.execution_count);
    println!("Current:    {}", activity.is_last);
    if let Some(ref analysis) = activity.analysis_id {
        println!("Analysis:   {analysis}");
    }
    if let Some(ref message) = activity.error_message {
        println!("---");
        println!("Error:      {message}");
    }
    if let Some(ref trace) = activity.error_stacktrace {
        println!("{trace}");
    }
    Ok(())
}

async fn cmd_activity(
    controller: &Controller,
    query: &ActivityQuery,
    json: bool,
) -> anyhow::Result<()> {
    let activities = controller.activities(query).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&activities)?);
        return Ok(());
    }

    if activities.is_empty() {
        println!("No activity found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<9}  {:<20}  {:>8}  EXECUTED",
        "ID", "TYPE", "STATUS", "COMPONENT", "MS"
    );
    println!("{}", "-".repeat(110));

    for activity in &activities {
        println!(
            "{:<36}  {:<12}  {:<9}  {:<20}  {:>8}  {}",
            activity.id,
            activity.task_type,
            activity.status,
            activity.component_id.as_deref().unwrap_or("-"),
            activity
                .execution_time_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string()),
            format_ms(activity.executed_at)
        );
    }

    println!("\n{} activit(ies), page {}", activities.len(), query.page);
    Ok(())
}

async fn cmd_status(controller: &Controller) -> anyhow::Result<()> {
    let counts = controller.counts().await?;
    let totals: HashMap<ActivityStatus, u64> = controller
        .store()
        .count_activities()
        .await?
        .into_iter()
        .collect();
    let total = |status| totals.get(&status).copied().unwrap_or(0);

    println!("Pending:      {}", counts.pending);
    println!("In progress:  {}", counts.in_progress);
    println!("Succeeded:    {}", total(ActivityStatus::Success));
    println!("Failed:       {}", total(ActivityStatus::Failed));
    println!("Canceled:     {}", total(ActivityStatus::Canceled));
    Ok(())
}
