//! taskq CLI: run a worker or operate on a running deployment.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use serde_json::{Map, Value, json};
use taskq::config::{Config, WorkerFile};
use taskq::model::{CronEntry, DedupKey, QueueSettings};
use taskq::registry::TaskFailure;
use taskq::telemetry::{TelemetryConfig, init_telemetry};
use taskq::{Admin, Broker, Invocation, Submitted, TaskClient, TaskContext, TaskRegistry, Worker};

#[derive(Parser)]
#[command(name = "taskq", about = "Store-backed task queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct CallArgs {
    /// Function name, or "queue:function"
    function: String,
    /// Positional argument (JSON, or a bare string)
    #[arg(long = "arg")]
    args: Vec<String>,
    /// Keyword argument as name=value (JSON, or a bare string)
    #[arg(long = "kwarg")]
    kwargs: Vec<String>,
    /// Queue override
    #[arg(long)]
    queue: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker with the built-in tasks (echo, sleep, shell)
    Serve {
        /// Worker TOML file (defaults to TASKQ_WORKER_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Worker id (defaults to TASKQ_WORKER_ID, then this host's IP)
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Enqueue a call
    Enqueue {
        #[command(flatten)]
        call: CallArgs,
        /// Push to the head of the queue
        #[arg(long)]
        priority: bool,
        /// Go through the intake buffer
        #[arg(long)]
        buffer: bool,
    },
    /// Show whether a call is running, queued or absent
    Status {
        #[command(flatten)]
        call: CallArgs,
        /// Move a queued call to the head
        #[arg(long)]
        promote: bool,
    },
    /// List published worker states
    Workers,
    /// List in-flight jobs
    Threads {
        #[arg(long)]
        worker: Option<String>,
    },
    /// Grow or shrink a worker's thread count on a queue
    Scale {
        worker: String,
        queue: String,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
    },
    /// Ask a worker to republish state and reload its configuration
    Resync { worker: String },
    /// Terminate a process recorded by one of a worker's jobs
    Kill { worker: String, pid: u32 },
    /// Like kill, but the task is not reported as failed
    Cancel { worker: String, pid: u32 },
    /// Recent finished tasks, newest first
    Worklog {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Error record operations
    Errors {
        #[command(subcommand)]
        action: ErrorsAction,
    },
    /// Cron entry operations
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum ErrorsAction {
    List { queue: String },
    /// Move one record, or all with --all, back into the work queue
    Replay {
        queue: String,
        key: Option<String>,
        #[arg(long)]
        all: bool,
    },
    Delete { queue: String, key: String },
}

#[derive(clap::Args)]
struct CronArgs {
    function: String,
    #[arg(long, default_value = "default")]
    queue: String,
    #[arg(long)]
    hour: Option<u32>,
    #[arg(long)]
    minute: Option<u32>,
    #[arg(long = "arg")]
    args: Vec<String>,
    #[arg(long = "kwarg")]
    kwargs: Vec<String>,
}

#[derive(Subcommand)]
enum CronAction {
    Add(CronArgs),
    List,
    Remove(CronArgs),
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show settings, or update the ones given
    Settings {
        queue: String,
        #[arg(long)]
        thread_limit: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        batch_function: Option<String>,
    },
    /// Waiting envelopes, head first
    List { queue: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { config: file, worker_id } => cmd_serve(config, file, worker_id).await,
        command => {
            let store = taskq::store::open(config.store_url.expose_secret())?;
            let broker = Broker::new(store);
            run_admin(command, broker)
        }
    }
}

async fn cmd_serve(
    config: Config,
    file: Option<PathBuf>,
    worker_id: Option<String>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config("taskq", &config))?;

    let file = match file.or_else(|| config.worker_file.clone()) {
        Some(path) => WorkerFile::load(path)?,
        None => WorkerFile::default(),
    };
    let store = taskq::store::open(config.store_url.expose_secret())?;
    let id = worker_id.unwrap_or_else(|| config.worker_id());

    let worker = Worker::new(id, store, Arc::new(builtin_registry()), file.options)
        .with_config(file.queues);
    let handle = worker.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    tokio::task::spawn_blocking(move || worker.run()).await??;
    Ok(())
}

fn run_admin(command: Command, broker: Broker) -> anyhow::Result<()> {
    let admin = Admin::new(broker.clone());
    let client = TaskClient::new(broker, Arc::new(builtin_registry()));

    match command {
        Command::Serve { .. } => anyhow::bail!("serve does not run as an admin command"),
        Command::Enqueue {
            call,
            priority,
            buffer,
        } => {
            let mut invocation = invocation(&call)?;
            if priority {
                invocation = invocation.priority();
            }
            if buffer {
                invocation = invocation.via_buffer();
            }
            match client.invoke(invocation)? {
                Submitted::Enqueued(e) if e.created => println!("Enqueued: {}", e.key),
                Submitted::Enqueued(e) => println!("Already queued: {}", e.key),
                Submitted::Buffered(b) if b.accepted => println!("Buffered: {}", b.key),
                Submitted::Buffered(b) => println!("Already queued: {}", b.key),
            }
        }
        Command::Status { call, promote } => {
            let status = client.status(&invocation(&call)?, promote)?;
            println!("{status}");
        }
        Command::Workers => {
            let workers = admin.workers()?;
            if workers.is_empty() {
                println!("No workers found.");
                return Ok(());
            }
            println!(
                "{:<20}  {:<16}  {:<8}  {:<7}  {:<9}  {:<6}  HEARTBEAT",
                "WORKER", "HOST", "PID", "THREADS", "PROCESSED", "FAILED"
            );
            println!("{}", "-".repeat(96));
            for w in &workers {
                println!(
                    "{:<20}  {:<16}  {:<8}  {:<7}  {:<9}  {:<6}  {}",
                    w.worker,
                    w.host,
                    w.pid,
                    w.metrics.threads,
                    w.metrics.processed,
                    w.metrics.failed,
                    w.heartbeat_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Threads { worker } => {
            let jobs = admin.jobs(worker.as_deref())?;
            if jobs.is_empty() {
                println!("No running jobs.");
                return Ok(());
            }
            for job in &jobs {
                let pid = job
                    .envelope
                    .runtime
                    .process
                    .pid
                    .map_or("-".to_string(), |p| p.to_string());
                println!(
                    "{}/{}  {}  pid={}  since {}",
                    job.worker,
                    job.thread,
                    job.envelope.call.target,
                    pid,
                    job.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Scale {
            worker,
            queue,
            delta,
        } => {
            let count = admin.adjust_thread_count(&worker, &queue, delta)?;
            println!("{worker}: {count} thread(s) on {queue}");
        }
        Command::Resync { worker } => {
            admin.resync(&worker)?;
            println!("Resync requested for {worker}");
        }
        Command::Kill { worker, pid } => report_queued(admin.kill(&worker, pid)?),
        Command::Cancel { worker, pid } => report_queued(admin.cancel(&worker, pid)?),
        Command::Worklog { limit } => {
            for r in admin.worklog(limit)? {
                let ended = r
                    .ended_at
                    .map_or("-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
                println!(
                    "{}  {:<30}  rc={:<3}  {}/{}",
                    ended, r.target, r.return_code, r.worker, r.thread
                );
            }
        }
        Command::Errors { action } => match action {
            ErrorsAction::List { queue } => {
                let errors = admin.errors(&queue)?;
                for (key, env) in &errors {
                    let reason = env.runtime.reason.as_deref().unwrap_or("-");
                    let first = reason.lines().next().unwrap_or("-");
                    println!(
                        "{}  {}  rc={}  {}",
                        short(key),
                        env.call.target,
                        env.runtime.return_code.unwrap_or_default(),
                        first
                    );
                }
                println!("\n{} error record(s)", errors.len());
            }
            ErrorsAction::Replay { queue, key, all } => {
                if all {
                    println!("Replayed {} record(s)", admin.replay_all_errors(&queue)?);
                } else {
                    let key = resolve_error_key(&admin, &queue, key.as_deref())?;
                    let enqueued = admin.replay_error(&queue, &key)?;
                    println!("Replayed as {}", enqueued.key);
                }
            }
            ErrorsAction::Delete { queue, key } => {
                let key = resolve_error_key(&admin, &queue, Some(&key))?;
                admin.delete_error(&queue, &key)?;
                println!("Deleted {key}");
            }
        },
        Command::Cron { action } => match action {
            CronAction::Add(args) => {
                let added = admin.add_cron(&cron_entry(args)?)?;
                println!("{}", if added { "Added" } else { "Already present" });
            }
            CronAction::List => {
                for e in admin.cron_entries()? {
                    let hour = e.hour.map_or("*".to_string(), |h| format!("{h:02}"));
                    let minute = format!("{:02}", e.minute.unwrap_or(0));
                    println!("{hour}:{minute}  {}:{}", e.queue, e.function);
                }
            }
            CronAction::Remove(args) => {
                let removed = admin.remove_cron(&cron_entry(args)?)?;
                println!("{}", if removed { "Removed" } else { "Not found" });
            }
        },
        Command::Queue { action } => match action {
            QueueAction::Settings {
                queue,
                thread_limit,
                batch_size,
                batch_function,
            } => {
                let mut settings = admin.queue_settings(&queue)?;
                let changed =
                    thread_limit.is_some() || batch_size.is_some() || batch_function.is_some();
                if changed {
                    settings = QueueSettings {
                        thread_limit: thread_limit.or(settings.thread_limit),
                        batch_size: batch_size.or(settings.batch_size),
                        batch_function: batch_function.or(settings.batch_function),
                    };
                    admin.set_queue_settings(&queue, &settings)?;
                }
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
            QueueAction::List { queue } => {
                let queued = admin.broker().list_queued(&queue)?;
                for (key, env) in &queued {
                    println!("{}  {}", short(key), env.call.target);
                }
                println!("\n{} queued", queued.len());
            }
        },
    }
    Ok(())
}

fn short(key: &DedupKey) -> &str {
    key.as_str().get(..12).unwrap_or(key.as_str())
}

fn report_queued(queued: bool) {
    if queued {
        println!("Command queued");
    } else {
        println!("Same command already pending");
    }
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwargs(raw: &[String]) -> anyhow::Result<Map<String, Value>> {
    raw.iter()
        .map(|kv| {
            let (name, value) = kv
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("kwarg {kv:?} is not name=value"))?;
            Ok((name.to_string(), parse_value(value)))
        })
        .collect()
}

fn invocation(call: &CallArgs) -> anyhow::Result<Invocation> {
    let mut invocation = Invocation::new(&call.function)
        .args(call.args.iter().map(|a| parse_value(a)))
        .kwargs(parse_kwargs(&call.kwargs)?);
    if let Some(queue) = &call.queue {
        invocation = invocation.queue(queue);
    }
    Ok(invocation)
}

fn cron_entry(args: CronArgs) -> anyhow::Result<CronEntry> {
    let mut entry = CronEntry::new(args.function, args.queue).at(args.hour, args.minute);
    entry.args = args.args.iter().map(|a| parse_value(a)).collect();
    entry.kwargs = parse_kwargs(&args.kwargs)?;
    Ok(entry)
}

/// Accept a full key or a unique prefix of one.
fn resolve_error_key(admin: &Admin, queue: &str, key: Option<&str>) -> anyhow::Result<DedupKey> {
    let Some(prefix) = key else {
        anyhow::bail!("give a key or --all");
    };
    let mut matches: Vec<DedupKey> = admin
        .errors(queue)?
        .into_iter()
        .map(|(k, _)| k)
        .filter(|k| k.as_str().starts_with(prefix))
        .collect();
    match (matches.pop(), matches.len()) {
        (Some(key), 0) => Ok(key),
        (Some(_), n) => anyhow::bail!("{} error records match '{prefix}', be more specific", n + 1),
        (None, _) => anyhow::bail!("no error record matching '{prefix}' in {queue}"),
    }
}

// ---------------------------------------------------------------------------
// Built-in tasks
// ---------------------------------------------------------------------------

fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register("echo", "default", echo)
        .register("sleep", "default", sleep)
        .register("shell", "default", shell);
    registry
}

fn echo(_ctx: &TaskContext, args: &[Value], kwargs: &Map<String, Value>) -> anyhow::Result<Value> {
    Ok(json!({ "args": args, "kwargs": kwargs }))
}

/// `sleep(seconds)`, reporting progress once a second.
fn sleep(ctx: &TaskContext, args: &[Value], _kwargs: &Map<String, Value>) -> anyhow::Result<Value> {
    let seconds = args
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("sleep expects a whole number of seconds"))?;
    for elapsed in 1..=seconds {
        std::thread::sleep(Duration::from_secs(1));
        ctx.progress(json!({ "elapsed": elapsed, "total": seconds }))?;
    }
    Ok(json!(seconds))
}

/// `shell(command)`: run through `sh -c`; a non-zero exit fails the task
/// with the exit code.
fn shell(ctx: &TaskContext, args: &[Value], _kwargs: &Map<String, Value>) -> anyhow::Result<Value> {
    let command = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("shell expects a command string"))?;
    let child = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    ctx.record_process(child.id(), command)?;

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TaskFailure::new(code, format!("exit {code}: {}", stderr.trim())).into());
    }
    Ok(Value::String(
        String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
    ))
}
