use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use review_pool::cli::{Cli, CliCommand};
use review_pool::config::Config;
use review_pool::error::Result;
use review_pool::pool::{BatchRequest, PoolConfig, ReviewPool};
use review_pool::process::CommandLauncher;
use review_pool::progress::{BroadcastReporter, OverallStatus};
use review_pool::prompts::PromptEngine;
use review_pool::review::Category;
use review_pool::runner::AnalysisCommand;
use review_pool::store::{FileStore, ReviewStore};

const PROGRESS_CAPACITY: usize = 256;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    info!(?config, "config loaded");

    let result = match cli.command {
        CliCommand::Run {
            task_id,
            description,
            dir,
            changed_files,
            categories,
        } => {
            let working_dir = match dir {
                Some(dir) => PathBuf::from(dir),
                None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            };
            let categories = if categories.is_empty() {
                Category::ALL.to_vec()
            } else {
                categories
            };
            let batch = BatchRequest {
                task_id,
                working_dir,
                task_description: description,
                changed_files,
                categories,
            };
            run_batch(&config, batch).await
        }
        CliCommand::Status { task_id } => print_records(&config, &task_id),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

/// Run one batch to completion. Returns the process exit code.
async fn run_batch(config: &Config, batch: BatchRequest) -> Result<i32> {
    let reporter = Arc::new(BroadcastReporter::new(PROGRESS_CAPACITY));
    let mut progress = reporter.subscribe();

    let pool_config = PoolConfig {
        max_concurrent: config.max_concurrent,
        timeouts: config.timeouts(),
        command: AnalysisCommand::new(
            config.agent_binary.clone(),
            config.agent_model.clone(),
            config.max_turns,
        ),
        prompts: PromptEngine::new(config.prompt_dir.clone()),
    };
    let (pool, events) = ReviewPool::new(
        pool_config,
        CommandLauncher::default(),
        FileStore::new(&config.store_path),
        Arc::clone(&reporter),
    );
    let (handle, join) = pool.spawn(events);

    let task_id = batch.task_id.clone();
    let mut state = handle.start_batch(batch).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while state.status == OverallStatus::InProgress {
        tokio::select! {
            update = progress.recv() => match update {
                Ok(update) => {
                    eprintln!("{}", update.render_line());
                    if update.task_id == task_id && update.current_activity.is_none() {
                        state = handle.status(&task_id).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress output lagged");
                    state = handle.status(&task_id).await?;
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                warn!(task_id, "interrupted, cancelling reviews");
                handle.cancel(&task_id).await?;
                drop(handle);
                if let Err(e) = join.await {
                    warn!(error = %e, "review pool task failed");
                }
                return Ok(130);
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&state)?);

    drop(handle);
    if let Err(e) = join.await {
        warn!(error = %e, "review pool task failed");
    }

    Ok(match state.status {
        OverallStatus::Completed => 0,
        _ => 1,
    })
}

fn print_records(config: &Config, task_id: &str) -> Result<i32> {
    let store = FileStore::new(&config.store_path);
    let records = store.list(task_id)?;
    if records.is_empty() {
        info!(task_id, path = %store.path().display(), "no review records");
    }
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(0)
}
