// src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use taper::config;
use taper::logging;
use taper::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "taper")]
#[command(about = "Background downloader for multi-file recordings", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue the files of a recording.
    Enqueue {
        /// Recording identifier; files land in `<download_root>/<recording>/`.
        recording: String,
        /// File URLs. The file name is taken from the last path segment.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Lower runs first.
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// Show the status of a recording and its jobs.
    Status {
        recording: String,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Pause a queued or running job.
    Pause { job: String },

    /// Put a paused job back in the queue.
    Resume { job: String },

    /// Cancel a job and discard its partial file.
    Cancel { job: String },

    /// Mark a recording for deletion. Files are removed after the grace period.
    Delete { recording: String },

    /// Process the queue until it is empty (or forever with --watch).
    Run {
        /// Keep running after the queue drains.
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() {
    if logging::init_logging().is_err() {
        logging::init_logging_stderr();
    }

    if let Err(err) = run(Cli::parse()).await {
        eprintln!("taper error: {:#}", err);
        std::process::exit(1);
    }
}

async fn open_manager(cfg: EngineConfig) -> Result<Arc<DownloadManager>> {
    let db_path = cfg.resolve_database_path()?;
    let download_root = cfg.resolve_download_root()?;
    let store = StateManager::new(&db_path)
        .await
        .with_context(|| format!("opening job database {}", db_path.display()))?;
    let client = HttpClient::new(&cfg.user_agent, cfg.connect_timeout())?;
    Ok(Arc::new(DownloadManager::new(
        Arc::new(store),
        Arc::new(client),
        Arc::new(SystemConstraints),
        cfg,
        download_root,
    )))
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::load_or_init()?;
    let manager = open_manager(cfg).await?;

    match cli.command {
        Command::Enqueue {
            recording,
            urls,
            priority,
        } => {
            let files = urls
                .into_iter()
                .map(|url| {
                    let name = file_name_from_url(&url);
                    FileRequest::new(name, url)
                })
                .collect();
            for id in manager.enqueue(&recording, files, priority).await? {
                println!("{id}");
            }
        }
        Command::Status { recording, json } => {
            let status = manager.get_status(&recording).await?;
            let jobs = manager.jobs_for_recording(&recording).await?;
            if json {
                let out = serde_json::json!({ "status": status, "jobs": jobs });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("{}: {}", recording, describe(&status));
                for job in jobs {
                    let deleted = if job.is_marked_for_deletion { " (deleting)" } else { "" };
                    println!(
                        "  {}  {:<11} {:>6.1}%  {}{}",
                        job.id,
                        job.status.as_str(),
                        job.progress * 100.0,
                        job.filename,
                        deleted
                    );
                    if let Some(err) = job.error_message {
                        println!("      error: {err}");
                    }
                }
            }
        }
        Command::Pause { job } => manager.pause(&job).await?,
        Command::Resume { job } => manager.resume(&job).await?,
        Command::Cancel { job } => manager.cancel(&job).await?,
        Command::Delete { recording } => {
            let marked = manager.mark_for_deletion(&recording).await?;
            println!("marked {marked} job(s) of {recording} for deletion");
        }
        Command::Run { watch } => run_until_done(manager, watch).await?,
    }
    Ok(())
}

async fn run_until_done(manager: Arc<DownloadManager>, watch: bool) -> Result<()> {
    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    let mut poll = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; pausing active downloads");
                break;
            }
            _ = poll.tick() => {
                if !watch && manager.is_idle().await? {
                    break;
                }
            }
        }
    }

    manager.shutdown().await;
    runner.await??;
    Ok(())
}

fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

fn describe(status: &RecordingDownloadStatus) -> String {
    match status {
        RecordingDownloadStatus::NotDownloaded => "not downloaded".to_string(),
        RecordingDownloadStatus::Downloaded => "downloaded".to_string(),
        RecordingDownloadStatus::Failed { message } => format!("failed ({message})"),
        RecordingDownloadStatus::Downloading {
            progress,
            completed_tracks,
            total_tracks,
            ..
        } => {
            if *progress < 0.0 {
                format!("downloading, {completed_tracks}/{total_tracks} tracks")
            } else {
                format!(
                    "downloading, {completed_tracks}/{total_tracks} tracks, current {:.1}%",
                    progress * 100.0
                )
            }
        }
    }
}
