mod broadcast;
mod config;
mod delivery;
mod error;
mod handlers;
mod membership;
mod pid;
mod progress;
mod quality;
mod tasks;
mod users;
mod yt_dlp;

use crate::config::Config;
use crate::error::{AppError, LockError};
use crate::pid::PidLock;
use handlers::{build_handler, AppServices};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use teloxide::{net::default_reqwest_settings, prelude::*};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenv::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("fatal error: {err}");
        error!(error = %err, "Application terminated with fatal error");
        return Err(err);
    }
    info!("Application shutdown complete");
    Ok(())
}

/// Logs to stdout, and additionally to `LOG_FILE` when it is set.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_path = std::env::var("LOG_FILE").ok().filter(|p| !p.trim().is_empty());
    let (log_file, open_error) = match log_path.as_deref().map(|p| open_log_file(Path::new(p))) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };
    let file_layer = log_file.map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    if let Some(err) = open_error {
        warn!(path = ?log_path, error = %err, "Failed to open log file, logging to stdout only");
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[instrument]
async fn run() -> Result<(), AppError> {
    info!("Initializing YouTube quality bot");

    let config = Arc::new(Config::from_env()?);
    info!(config = ?config, "Configuration loaded");

    let lock = match PidLock::acquire(config.pid_file.clone()) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning { pid }) => {
            error!(pid, "Another instance is already running");
            return Err(LockError::AlreadyRunning { pid }.into());
        }
        Err(err) => return Err(err.into()),
    };
    info!(path = %lock.path().display(), "Instance lock held");

    yt_dlp::check_tool("ffmpeg", "-version").await?;
    if let Err(err) = yt_dlp::check_tool(&config.yt_dlp.binary, "--version").await {
        warn!(error = %err, "yt-dlp check failed; link handling will report errors");
    }

    tokio::fs::create_dir_all(&config.download_dir).await?;

    let client = default_reqwest_settings()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(600))
        .build()
        .map_err(|e| {
            error!(error = %e, "Failed to build HTTP client");
            e
        })?;
    info!("HTTP client configured successfully");

    let mut bot = Bot::with_client(config.bot_token.clone(), client);
    if let Some(api_url) = config.bot_api_url.clone() {
        info!(api_url = %api_url, "Using custom Bot API server");
        bot = bot.set_api_url(api_url);
    }
    info!("Telegram bot initialized");

    let shutdown = CancellationToken::new();
    let services = AppServices::new(config.clone(), shutdown.clone());
    info!("Application services initialized");

    let mut dispatcher = Dispatcher::builder(bot, build_handler())
        .dependencies(dptree::deps![services])
        .build();
    info!("Dispatcher built successfully");

    let shutdown_token = dispatcher.shutdown_token();
    tokio::spawn(
        async move {
            info!("Shutdown signal handler spawned");
            shutdown_signal().await;
            info!("Shutdown signal received, cancelling downloads");
            shutdown.cancel();
            if let Ok(wait) = shutdown_token.shutdown() {
                wait.await;
                info!("Graceful shutdown completed");
            } else {
                warn!("Failed to initiate graceful shutdown");
            }
        }
        .in_current_span(),
    );

    info!("Starting dispatcher event loop");
    dispatcher.dispatch().await;
    info!("Dispatcher stopped");
    Ok(())
}

#[cfg(unix)]
#[instrument]
async fn shutdown_signal() {
    let term = signal(SignalKind::terminate());
    let interrupt = signal(SignalKind::interrupt());
    match (term, interrupt) {
        (Ok(mut term), Ok(mut interrupt)) => {
            tokio::select! {
                _ = term.recv() => info!("Received SIGTERM signal"),
                _ = interrupt.recv() => info!("Received SIGINT signal"),
            }
        }
        (Ok(mut term), Err(err)) => {
            warn!(error = %err, "Failed to register SIGINT handler, falling back to SIGTERM only");
            let _ = term.recv().await;
            info!("Received SIGTERM signal");
        }
        (Err(err), Ok(mut interrupt)) => {
            warn!(error = %err, "Failed to register SIGTERM handler, falling back to SIGINT only");
            let _ = interrupt.recv().await;
            info!("Received SIGINT signal");
        }
        (Err(term_err), Err(int_err)) => {
            error!(sigterm_error = %term_err, sigint_error = %int_err, "Failed to register both SIGTERM and SIGINT handlers");
            warn!("Falling back to Ctrl+C handler");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C");
        }
    }
}

#[cfg(not(unix))]
#[instrument]
async fn shutdown_signal() {
    info!("Waiting for Ctrl+C signal");
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C signal");
}
