use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Teloxide request error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Instance lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Required tool `{tool}` is not usable: {reason}")]
    MissingTool { tool: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing bot token: set TELEGRAM_BOT_TOKEN")]
    MissingToken,

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("invalid BOT_API_URL: {0}")]
    ApiUrl(String),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another instance is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to access user data file: {0}")]
    Io(#[from] io::Error),

    #[error("user data file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Failure to read formats and metadata for a URL.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("unsupported URL: {0}")]
    Unsupported(String),

    #[error("video unavailable: {0}")]
    Unavailable(String),

    #[error("extractor failed: {0}")]
    Upstream(String),

    #[error("failed to run extractor: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse extractor output: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ExtractionError {
    pub fn user_message(&self) -> &'static str {
        "Error getting video information.\nPlease try another link or try again later."
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidSelection {
    #[error("malformed selection payload")]
    Malformed,

    #[error("selection is unknown or expired")]
    Expired,

    #[error("download already started for this selection")]
    AlreadyStarted,

    #[error("selection belongs to another chat")]
    WrongChat,

    #[error("quality was not offered for this selection")]
    UnknownQuality,
}

impl InvalidSelection {
    pub fn user_message(&self) -> &'static str {
        match self {
            InvalidSelection::AlreadyStarted => "This download has already started.",
            _ => "This option expired, please resend the link.",
        }
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("requested format is unavailable: {0}")]
    FormatUnavailable(String),

    #[error("no space left on device")]
    DiskFull,

    #[error("file exceeds the maximum size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("download exceeded the time limit of {0:?}")]
    TimedOut(Duration),

    #[error("download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("extractor produced no output file")]
    NoOutput,

    #[error("download failed: {0}")]
    Failed(String),
}

impl DownloadError {
    pub fn user_message(&self) -> &'static str {
        match self {
            DownloadError::TooLarge { .. } => "❌ This video is too large to download.",
            DownloadError::TimedOut(_) => "❌ Download took too long and was stopped.",
            DownloadError::Cancelled => "❌ Download cancelled, the bot is shutting down.",
            _ => "❌ Failed to download video. Please try again later.",
        }
    }
}

#[derive(Error, Debug)]
pub enum MembershipCheckError {
    #[error("membership lookup failed for {channel}: {source}")]
    Lookup {
        channel: String,
        #[source]
        source: teloxide::RequestError,
    },
}
