use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use payclass_classify::read_csv;
use payclass_core::BatchStatus;
use payclass_sync::{
    build_cleanup_scheduler, build_runtime, JobEvent, JobStore, PgJobStore, RecoveryOutcome,
    RecoveryStrategy, SyncConfig, SyncRuntime,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "payclass-cli")]
#[command(about = "Payee batch classification command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload a CSV and create a batch job from its unique payees.
    Submit {
        file: PathBuf,
        #[arg(long, default_value = "Payee")]
        payee_column: String,
        #[arg(long)]
        description: Option<String>,
        /// Keep polling until the job finishes.
        #[arg(long)]
        wait: bool,
    },
    /// Follow a job until its results are saved or it ends.
    Watch { job_id: String },
    Recover {
        job_id: String,
        /// `recreate` or `local`
        #[arg(long, default_value = "recreate")]
        strategy: String,
    },
    /// List completed jobs without stored rows.
    Orphans {
        #[arg(long)]
        fix: bool,
    },
    Cleanup {
        /// Also drop jobs the provider does not know.
        #[arg(long)]
        phantoms: bool,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Submit {
            file,
            payee_column,
            description,
            wait,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let upload = read_csv(&bytes).with_context(|| format!("parsing {}", file.display()))?;
            let runtime = build_runtime(config).await?;
            let job = runtime
                .engine
                .submit(upload, &payee_column, description.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!(
                "submitted: job_id={} payees={} status={}",
                job.id, job.metadata.payee_count, job.status
            );
            if wait {
                watch(&runtime, &job.id).await?;
            }
        }
        Commands::Watch { job_id } => {
            let runtime = build_runtime(config).await?;
            runtime
                .service
                .job(&job_id)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            runtime.engine.track(&job_id);
            watch(&runtime, &job_id).await?;
        }
        Commands::Recover { job_id, strategy } => {
            let Some(strategy) = RecoveryStrategy::parse(&strategy) else {
                bail!("unknown recovery strategy {strategy:?}; use recreate or local");
            };
            let runtime = build_runtime(config).await?;
            let outcome = runtime
                .engine
                .recover(&job_id, strategy)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            match outcome {
                RecoveryOutcome::Recreated { previous, job } => {
                    println!("recreated: previous={previous} job_id={}", job.id)
                }
                RecoveryOutcome::LocalFallback { stats } => println!(
                    "classified locally: rows={} failed={} cached={}",
                    stats.written, stats.failed_rows, stats.cached_locally
                ),
            }
        }
        Commands::Orphans { fix } => {
            let runtime = build_runtime(config).await?;
            let orphans = runtime.service.find_orphaned_jobs().await?;
            if orphans.is_empty() {
                println!("no orphaned jobs");
            }
            for job in orphans {
                println!("orphan: job_id={} payees={}", job.id, job.metadata.payee_count);
                if fix {
                    match runtime.service.ensure_results(&job.id).await {
                        Ok(outcome) => println!("  {}", serde_json::to_string(&outcome)?),
                        Err(err) => println!("  failed: {}", err.user_message()),
                    }
                }
            }
        }
        Commands::Cleanup { phantoms } => {
            let runtime = build_runtime(config).await?;
            let now = Utc::now();
            for (job, assessment) in runtime.service.stuck_jobs(now).await {
                if let Some(advice) = assessment.advisory() {
                    println!("stuck: job_id={} {advice}", job.id);
                }
            }
            let report = runtime.service.auto_cleanup(now).await;
            println!("cleanup: {}", serde_json::to_string(&report)?);
            if phantoms {
                let jobs = runtime.state().jobs().await;
                let report = runtime.engine.cleanup_phantom_jobs(&jobs).await;
                println!("phantoms: {}", serde_json::to_string(&report)?);
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is not set");
            };
            let store = PgJobStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let runtime = build_runtime(config).await?;
            let scheduler = build_cleanup_scheduler(runtime.service.clone()).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting cleanup scheduler")?;
            }
            payclass_web::serve(runtime, port).await?;
        }
    }

    Ok(())
}

/// Prints events for one job until it settles or the user interrupts.
async fn watch(runtime: &SyncRuntime, job_id: &str) -> Result<()> {
    let mut events = runtime.state().subscribe();
    let job = runtime
        .service
        .job(job_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    if job.status == BatchStatus::Completed {
        let rows = runtime.service.store().count_classifications(job_id).await?;
        if rows > 0 {
            println!("results already saved: job_id={job_id} rows={rows}");
            return Ok(());
        }
    } else if job.status.is_terminal() {
        println!("job {job_id} already ended: status={}", job.status);
        return Ok(());
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("stopped watching {job_id}");
                return Ok(());
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        eprintln!("missed {skipped} events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                };
                if event.job_id() != job_id {
                    continue;
                }
                println!("{}", serde_json::to_string(&event)?);
                match &event {
                    JobEvent::ResultsSaved { .. } | JobEvent::Removed { .. } => return Ok(()),
                    JobEvent::CompletionFailed { message, .. } => bail!("{message}"),
                    JobEvent::Updated { job }
                        if job.status.is_terminal()
                            && job.status != BatchStatus::Completed =>
                    {
                        return Ok(())
                    }
                    _ => {}
                }
            }
        }
    }
}
