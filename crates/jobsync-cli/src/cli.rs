use crate::config::Config;
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use jobsync_core::app::{
    JobTracker, MultiJobCoordinator, ResumeOutcome, TrackingContext, session_cell,
};
use jobsync_core::domain::{
    ConnectionState, JobId, JobRecord, JobStatus, JobType, ProtocolAnomaly, SessionRef,
    StartRequest, TrackerError,
};
use jobsync_core::impls::{
    FileStorage, HttpJobApi, InMemoryBackend, SharedStorage, SseEventSource,
};
use jobsync_core::ports::{JobObserver, NoopObserver};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Pause before re-pulling a job whose stream dropped.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// `jobs --watch` re-lists this often to pick up new and cancelling jobs.
const WATCH_REFRESH: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "jobsync")]
#[command(about = "Start, follow and manage long-running backend jobs")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./jobsync.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the backend base URL.
    #[arg(long)]
    pub base_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a full lifecycle against a self-driving in-memory backend.
    Demo {
        /// Milliseconds between simulated progress steps.
        #[arg(long, default_value_t = 250)]
        tick_ms: u64,
    },
    /// Start a job and follow it until it finishes.
    Start {
        #[arg(long, value_enum)]
        kind: Kind,
        #[arg(long)]
        session: String,
    },
    /// Pick up the persisted job of a feature after a restart.
    Resume {
        #[arg(long, value_enum)]
        kind: Kind,
    },
    /// Ask the backend to cancel the persisted job of a feature.
    Stop {
        #[arg(long, value_enum)]
        kind: Kind,
    },
    /// List jobs; with --watch, follow every live one.
    Jobs {
        #[arg(long)]
        watch: bool,
    },
    /// Delete a finished job.
    Delete { id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Kind {
    Transform,
    DicomExtract,
}

impl From<Kind> for JobType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Transform => JobType::Transform,
            Kind::DicomExtract => JobType::DicomExtract,
        }
    }
}

/// Each feature persists its active job under its own key.
fn storage_key(kind: JobType) -> String {
    format!("jobsync.active.{}", kind.as_str())
}

pub async fn dispatch(args: Args) -> Result<()> {
    let cfg = Config::resolve(args.config.as_deref())?;
    init_logging(&args, &cfg)?;

    match &args.cmd {
        Command::Demo { tick_ms } => demo(Duration::from_millis(*tick_ms)).await,
        Command::Start { kind, session } => {
            let ctx = http_context(&args, &cfg)?;
            start(ctx, (*kind).into(), SessionRef::new(session.as_str())).await
        }
        Command::Resume { kind } => resume(http_context(&args, &cfg)?, (*kind).into()).await,
        Command::Stop { kind } => stop(http_context(&args, &cfg)?, (*kind).into()).await,
        Command::Jobs { watch } => jobs(http_context(&args, &cfg)?, *watch).await,
        Command::Delete { id } => delete(http_context(&args, &cfg)?, JobId::new(id.as_str())).await,
    }
}

fn init_logging(args: &Args, cfg: &Config) -> Result<()> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(())
}

fn http_context(args: &Args, cfg: &Config) -> Result<TrackingContext> {
    let base_url = args
        .base_url
        .clone()
        .unwrap_or_else(|| cfg.backend.base_url.clone());
    let timeout = Duration::from_secs(cfg.backend.request_timeout_secs);
    let storage = FileStorage::open(&cfg.storage.path)
        .with_context(|| format!("opening state file: {}", cfg.storage.path.display()))?;

    TrackingContext::builder()
        .api(Arc::new(HttpJobApi::new(base_url.as_str(), timeout)))
        .event_source(Arc::new(SseEventSource::new(base_url.as_str(), timeout)))
        .storage(Arc::new(storage))
        .build()
        .context("building tracking context")
}

async fn start(ctx: TrackingContext, kind: JobType, session: SessionRef) -> Result<()> {
    let tracker = JobTracker::new(ctx, storage_key(kind), Arc::new(ConsoleObserver));
    if let ResumeOutcome::Resumed(job) = tracker.resume().await.context("checking for an active job")? {
        bail!("{kind} job {} is still active; use `resume` or `stop`", job.id());
    }

    let job = tracker
        .start_job(StartRequest::new(kind, session))
        .await
        .context("starting job")?;
    println!("started {kind} job {}", job.id());
    report(follow(&tracker).await?)
}

async fn resume(ctx: TrackingContext, kind: JobType) -> Result<()> {
    let tracker = JobTracker::new(ctx, storage_key(kind), Arc::new(ConsoleObserver));
    match tracker.resume().await.context("resuming job")? {
        ResumeOutcome::Idle => {
            println!("no active {kind} job");
            Ok(())
        }
        ResumeOutcome::AlreadyFinished(record) => report(Some(record)),
        ResumeOutcome::Resumed(job) => {
            println!("following {kind} job {}", job.id());
            report(follow(&tracker).await?)
        }
    }
}

async fn stop(ctx: TrackingContext, kind: JobType) -> Result<()> {
    let tracker = JobTracker::new(ctx, storage_key(kind), Arc::new(ConsoleObserver));
    let job = match tracker.resume().await.context("resuming job")? {
        ResumeOutcome::Idle => {
            println!("no active {kind} job");
            return Ok(());
        }
        ResumeOutcome::AlreadyFinished(record) => return report(Some(record)),
        ResumeOutcome::Resumed(job) => job,
    };

    if !tracker.stop().await.context("stopping job")? {
        println!("job {} is {}; nothing to stop", job.id(), job.status());
        return Ok(());
    }
    println!("stop requested for job {}", job.id());
    report(follow(&tracker).await?)
}

async fn jobs(ctx: TrackingContext, watch: bool) -> Result<()> {
    let coordinator = MultiJobCoordinator::new(ctx, Arc::new(ConsoleObserver));
    coordinator.refresh().await.context("listing jobs")?;
    print_table(&coordinator.jobs());
    if !watch {
        coordinator.teardown();
        return Ok(());
    }

    let _completions = coordinator.follow_external_completions();
    let mut snapshots = coordinator.watch();
    let mut ticker = tokio::time::interval(WATCH_REFRESH);
    ticker.tick().await;
    while coordinator.counts().active() > 0 {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = coordinator.refresh().await {
                    warn!(error = %err, "re-listing jobs failed");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.teardown();
    print_table(&coordinator.jobs());
    Ok(())
}

async fn delete(ctx: TrackingContext, id: JobId) -> Result<()> {
    let coordinator = MultiJobCoordinator::new(ctx, Arc::new(NoopObserver));
    coordinator.refresh().await.context("listing jobs")?;
    coordinator.teardown();
    coordinator
        .delete(&id)
        .await
        .with_context(|| format!("deleting job {id}"))?;
    println!("deleted job {id}");
    Ok(())
}

/// Two contexts over one in-memory backend: a feature tracker and a job list
/// that re-fetches when the tracker announces a completion.
async fn demo(tick: Duration) -> Result<()> {
    let backend = Arc::new(InMemoryBackend::new().with_auto_run(tick));
    let storage = SharedStorage::new();
    let (sessions, current) = session_cell(None);

    let feature_ctx = TrackingContext::builder()
        .backend(backend.clone())
        .storage(Arc::new(storage.context()))
        .session(current)
        .build()
        .context("building feature context")?;
    let list_ctx = TrackingContext::builder()
        .backend(backend)
        .storage(Arc::new(storage.context()))
        .build()
        .context("building list context")?;

    let list = MultiJobCoordinator::new(list_ctx, Arc::new(NoopObserver));
    let _completions = list.follow_external_completions();

    sessions.select(SessionRef::new("demo-capture"));
    let transform = JobTracker::new(
        feature_ctx.clone(),
        storage_key(JobType::Transform),
        Arc::new(ConsoleObserver),
    );
    let job = transform
        .start_for_current_session(JobType::Transform, serde_json::json!({ "preset": "default" }))
        .await
        .context("starting transform")?;
    println!("started transform job {}", job.id());
    list.refresh().await.context("listing jobs")?;
    report(follow(&transform).await?)?;

    let extract = JobTracker::new(
        feature_ctx,
        storage_key(JobType::DicomExtract),
        Arc::new(ConsoleObserver),
    );
    let job = extract
        .start_for_current_session(JobType::DicomExtract, serde_json::Value::Null)
        .await
        .context("starting extraction")?;
    println!("started extraction job {}", job.id());
    extract
        .watch()
        .wait_for(|job| {
            job.as_ref().is_some_and(|job| {
                job.record().is_terminal()
                    || (job.status() == JobStatus::Running && job.record().progress >= 20)
            })
        })
        .await
        .context("waiting for extraction to run")?;
    extract.stop().await.context("stopping extraction")?;
    report(follow(&extract).await?)?;

    list.refresh().await.context("listing jobs")?;
    print_table(&list.jobs());
    let counts = list.counts();
    println!(
        "{} jobs: {} completed, {} cancelled, {} active",
        counts.total(),
        counts.completed,
        counts.cancelled,
        counts.active()
    );
    list.teardown();
    Ok(())
}

/// Wait for the tracked job to finish. Returns `None` when the user detaches.
async fn follow(tracker: &JobTracker) -> Result<Option<JobRecord>> {
    let mut rx = tracker.watch();
    loop {
        let snapshot = rx.borrow_and_update().clone();
        let Some(job) = snapshot else {
            return Ok(None);
        };
        if job.record().is_terminal() {
            return Ok(Some(job.into_record()));
        }
        if job.connection() == ConnectionState::Closed {
            tokio::time::sleep(RECONNECT_DELAY).await;
            tracker
                .refresh()
                .await
                .context("re-pulling job after the stream dropped")?;
            continue;
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(None);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(job_id = %job.id(), "detached; the job keeps running and can be resumed");
                return Ok(None);
            }
        }
    }
}

fn report(finished: Option<JobRecord>) -> Result<()> {
    let Some(job) = finished else {
        return Ok(());
    };
    match job.status {
        JobStatus::Failed => bail!(
            "job {} failed: {}",
            job.id,
            job.error_message.as_deref().unwrap_or("no details")
        ),
        _ => {
            println!("job {} finished: {}", job.id, job.status);
            Ok(())
        }
    }
}

fn print_table(jobs: &[JobRecord]) {
    println!(
        "{:<28} {:<14} {:<11} {:>4}  {}",
        "ID", "TYPE", "STATUS", "PCT", "SESSION"
    );
    for job in jobs {
        println!(
            "{:<28} {:<14} {:<11} {:>3}%  {}",
            job.id.as_str(),
            job.job_type.as_str(),
            job.status.as_str(),
            job.progress,
            job.trace_name.as_deref().unwrap_or(job.session_ref.as_str())
        );
    }
}

struct ConsoleObserver;

impl JobObserver for ConsoleObserver {
    fn on_update(&self, job: &JobRecord) {
        if job.is_processing() {
            println!("  {} {} {:>3}%", job.id, job.status, job.progress);
        }
    }

    fn on_error(&self, error: &TrackerError) {
        eprintln!("  ! {error}");
    }

    fn on_success(&self, job: &JobRecord) {
        match &job.output_ref {
            Some(output) => println!("  {} completed -> {output}", job.id),
            None => println!("  {} completed", job.id),
        }
    }

    fn on_failure(&self, job: &JobRecord) {
        println!(
            "  {} failed: {}",
            job.id,
            job.error_message.as_deref().unwrap_or("no details")
        );
    }

    fn on_cancelled(&self, job: &JobRecord) {
        println!("  {} cancelled", job.id);
    }

    fn on_anomaly(&self, anomaly: &ProtocolAnomaly) {
        eprintln!("  ? {anomaly}");
    }
}
