mod logging;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use thumbq::config::{load_config, Config};
use thumbq::db::Database;
use thumbq::error::{ConfigError, ThumbqError};
use thumbq::job::{JobStatus, JobStore, SqliteJobStore};
use thumbq::pipeline::{FfmpegCli, Pipeline, PipelineConfig};
use thumbq::queue::{QueueEventBroadcaster, SqliteTaskQueue, TaskQueue};
use thumbq::relay::{ChannelConnection, EventRelay};
use thumbq::service::{ServiceSettings, SubmitRequest, ThumbnailService};
use thumbq::worker::{TaskProcessor, WorkerPool};

use crate::logging::{init_logging, LogFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON config file. Built-in defaults are used when omitted.
    #[arg(short, long, env = "THUMBQ_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued thumbnail jobs until interrupted
    Run {
        /// Print job updates for this owner as JSON lines
        #[arg(long)]
        follow: Option<String>,
    },
    /// Copy files into the upload directory and queue thumbnail jobs
    Submit {
        #[arg(short, long)]
        owner: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print an owner's jobs, newest first
    List {
        #[arg(short, long)]
        owner: String,
    },
}

/// Everything the commands share, wired from one config.
struct Runtime {
    config: Config,
    store: Arc<dyn JobStore>,
    queue: Arc<SqliteTaskQueue>,
    relay: Arc<EventRelay>,
}

impl Runtime {
    fn open(config: Config) -> Result<Self, ThumbqError> {
        let db_path = config.database_path().ok_or_else(|| ConfigError::Validation {
            message: "Could not determine home directory; set database_path".to_string(),
        })?;
        let db = Database::open(&db_path)?;

        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone()));
        let queue = Arc::new(SqliteTaskQueue::with_events(
            db,
            config.queue.lease_timeout(),
            QueueEventBroadcaster::new(config.events.capacity),
        ));
        let relay = Arc::new(EventRelay::new(Arc::clone(&store)));

        Ok(Self {
            config,
            store,
            queue,
            relay,
        })
    }

    fn service(&self) -> ThumbnailService {
        ThumbnailService::new(
            Arc::clone(&self.store),
            self.queue.clone(),
            Arc::clone(&self.relay),
            ServiceSettings::from_config(&self.config),
        )
    }

    fn log_counts(&self) {
        let statuses = [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ];
        let counts: Vec<String> = statuses
            .iter()
            .filter_map(|s| match self.store.count_by_status(*s) {
                Ok(n) => Some(format!("{}={}", s, n)),
                Err(e) => {
                    warn!("Failed to count {} jobs: {}", s, e);
                    None
                }
            })
            .collect();
        info!("Jobs: {}", counts.join(" "));
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let result = load(cli.config.as_deref()).and_then(|config| {
        let runtime = Runtime::open(config)?;
        match cli.command {
            Commands::Run { follow } => run(&runtime, follow),
            Commands::Submit { owner, files } => submit(&runtime, &owner, &files),
            Commands::List { owner } => list(&runtime, &owner),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load(path: Option<&Path>) -> Result<Config, ThumbqError> {
    match path {
        Some(path) => {
            let config = load_config(path)?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => {
            let config = Config::default();
            thumbq::config::validate_config(&config)?;
            Ok(config)
        }
    }
}

fn run(runtime: &Runtime, follow: Option<String>) -> Result<(), ThumbqError> {
    let config = &runtime.config;
    let frames = Arc::new(FfmpegCli::new(&config.ffmpeg.binary));
    let pipeline = Arc::new(Pipeline::new(PipelineConfig::from_config(config), frames)?);

    let relay_handle = runtime.relay.start(runtime.queue.subscribe())?;

    // Kept alive until shutdown; dropping it unsubscribes.
    let follower = match follow {
        Some(owner) => {
            let (connection, rx) = ChannelConnection::bounded(config.events.capacity);
            let subscription = runtime.relay.subscribe(&owner, Arc::new(connection));
            let printer = std::thread::Builder::new()
                .name("thumbqd-follow".to_string())
                .spawn(move || {
                    for message in rx {
                        match serde_json::to_string(&message) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("Failed to serialize job update: {}", e),
                        }
                    }
                })?;
            Some((subscription, printer))
        }
        None => None,
    };

    let queue: Arc<dyn TaskQueue> = runtime.queue.clone();
    let processor = Arc::new(TaskProcessor::new(
        Arc::clone(&runtime.store),
        Arc::clone(&queue),
        pipeline,
    ));
    let pool = WorkerPool::new(
        queue,
        processor,
        config.worker_count,
        config.queue.poll_interval(),
    );
    runtime.log_counts();

    let (stop_tx, stop_rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| std::io::Error::other(format!("Failed to install Ctrl-C handler: {}", e)))?;

    info!("thumbqd running with {} workers; press Ctrl-C to stop", pool.worker_count());
    let _ = stop_rx.recv();

    pool.shutdown();
    pool.wait();

    runtime.relay.stop();
    if relay_handle.join().is_err() {
        error!("Event relay thread panicked");
    }

    if let Some((subscription, printer)) = follower {
        // Unregistering drops the last sender, which ends the printer.
        subscription.cancel();
        if printer.join().is_err() {
            error!("Follower thread panicked");
        }
    }

    runtime.log_counts();
    info!("thumbqd stopped");
    Ok(())
}

fn submit(runtime: &Runtime, owner: &str, files: &[PathBuf]) -> Result<(), ThumbqError> {
    let upload_dir = PathBuf::from(&runtime.config.upload_directory);
    std::fs::create_dir_all(&upload_dir)?;

    let mut requests = Vec::with_capacity(files.len());
    for file in files {
        requests.push(stage_upload(file, &upload_dir, owner)?);
    }

    let staged: Vec<PathBuf> = requests.iter().map(|r| r.source_path.clone()).collect();
    let jobs = match runtime.service().submit_batch(requests) {
        Ok(jobs) => jobs,
        Err(e) => {
            for path in &staged {
                let _ = std::fs::remove_file(path);
            }
            return Err(e.into());
        }
    };

    for job in &jobs {
        println!("{}", to_json(job)?);
    }
    info!("{} file(s) submitted", jobs.len());
    Ok(())
}

fn list(runtime: &Runtime, owner: &str) -> Result<(), ThumbqError> {
    let service = runtime.service();
    for job in service.list_by_owner(owner)? {
        println!("{}", to_json(&job)?);
    }
    Ok(())
}

/// Copies `file` into the upload directory under a unique name, the way an
/// upload endpoint stores incoming files.
fn stage_upload(file: &Path, upload_dir: &Path, owner: &str) -> Result<SubmitRequest, ThumbqError> {
    let metadata = std::fs::metadata(file)?;
    let original_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let mime_type = mime_guess::from_path(file)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let extension = file
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stored_name = format!(
        "{}-{}{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple(),
        extension
    );
    let source_path = upload_dir.join(stored_name);
    std::fs::copy(file, &source_path)?;

    Ok(SubmitRequest {
        owner_id: owner.to_string(),
        source_path,
        original_name,
        mime_type,
        size_bytes: metadata.len(),
    })
}

fn to_json(job: &thumbq::job::Job) -> Result<String, ThumbqError> {
    serde_json::to_string(job).map_err(|e| std::io::Error::from(e).into())
}
