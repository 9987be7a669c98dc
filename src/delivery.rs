use crate::{error::AppError, yt_dlp::DownloadedFile};
use async_trait::async_trait;
use rand::Rng;
use std::{path::Path, time::Duration};
use teloxide::{
    prelude::*,
    types::{InputFile, MessageId},
    ApiError, RequestError,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{info, instrument, warn};

/// Minimum spacing between edits of one status message.
pub const PROGRESS_UPDATE_EVERY: Duration = Duration::from_secs(3);
const UPLOAD_MAX_RETRIES: usize = 3;
const UPLOAD_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const UPLOAD_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// The two chat operations a download's status and delivery need.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), RequestError>;

    async fn send_video_file(
        &self,
        chat_id: ChatId,
        path: &Path,
        filename: &str,
        caption: &str,
    ) -> Result<(), RequestError>;
}

#[async_trait]
impl ChatTransport for Bot {
    async fn edit_text(&self, chat_id: ChatId, message_id: MessageId, text: &str) -> Result<(), RequestError> {
        self.edit_message_text(chat_id, message_id, text).await?;
        Ok(())
    }

    async fn send_video_file(
        &self,
        chat_id: ChatId,
        path: &Path,
        filename: &str,
        caption: &str,
    ) -> Result<(), RequestError> {
        let file = InputFile::file(path.to_path_buf()).file_name(filename.to_string());
        self.send_video(chat_id, file)
            .caption(caption.to_string())
            .supports_streaming(true)
            .await?;
        Ok(())
    }
}

/// Periodically rewrites a status message with fresh text, skipping edits
/// when nothing changed. The first edit waits a full period, since whoever
/// spawned the ticker has usually just written the message.
pub struct StatusTicker {
    done_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatusTicker {
    pub fn spawn<T, F>(
        transport: T,
        chat_id: ChatId,
        message_id: MessageId,
        current_text: Option<String>,
        mut render: F,
    ) -> Self
    where
        T: ChatTransport + 'static,
        F: FnMut() -> String + Send + 'static,
    {
        let (done_tx, mut done_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + PROGRESS_UPDATE_EVERY, PROGRESS_UPDATE_EVERY);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_text = current_text;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let text = render();
                        if last_text.as_deref() == Some(text.as_str()) {
                            continue;
                        }
                        match transport.edit_text(chat_id, message_id, &text).await {
                            Ok(_) => last_text = Some(text),
                            Err(err) if is_message_not_modified(&err) => last_text = Some(text),
                            Err(err) => warn!(event = "status_edit_failed", error = %err),
                        }
                    }
                    _ = done_rx.changed() => break,
                }
            }
        });
        Self { done_tx, task }
    }

    pub async fn stop(self) {
        let _ = self.done_tx.send(true);
        let _ = self.task.await;
    }
}

/// Uploads the file to the chat, then removes its job directory whatever the
/// upload outcome.
#[instrument(skip(transport, file, title), fields(chat_id = chat_id.0, size = file.size))]
pub async fn deliver<T>(
    transport: &T,
    chat_id: ChatId,
    message_id: MessageId,
    file: DownloadedFile,
    title: Option<&str>,
) -> Result<(), AppError>
where
    T: ChatTransport + Clone + 'static,
{
    let DownloadedFile { path, job, .. } = file;
    let started_at = Instant::now();
    let ticker = StatusTicker::spawn(transport.clone(), chat_id, message_id, None, move || {
        format!("📤 Uploading to Telegram... {}s", started_at.elapsed().as_secs())
    });

    let caption = upload_caption(title);
    let filename = upload_file_name(title, &path);
    let result = send_video_with_retry(transport, chat_id, &path, &filename, &caption).await;

    ticker.stop().await;
    job.remove().await;
    match &result {
        Ok(()) => info!(event = "delivery_complete"),
        Err(err) => warn!(event = "delivery_failed", error = %err),
    }
    result
}

async fn send_video_with_retry<T: ChatTransport>(
    transport: &T,
    chat_id: ChatId,
    path: &Path,
    filename: &str,
    caption: &str,
) -> Result<(), AppError> {
    for attempt in 1..=UPLOAD_MAX_RETRIES {
        match transport.send_video_file(chat_id, path, filename, caption).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                let Some(delay) = retry_delay_for_upload(&err, attempt) else {
                    return Err(err.into());
                };
                if attempt == UPLOAD_MAX_RETRIES {
                    return Err(err.into());
                }
                warn!("Upload attempt {attempt} failed; retrying in {delay:?}: {err}");
                time::sleep(delay).await;
            }
        }
    }
    Ok(())
}

fn retry_delay_for_upload(err: &RequestError, attempt: usize) -> Option<Duration> {
    match err {
        RequestError::RetryAfter(delay) => Some(delay.duration()),
        RequestError::Network(net) if net.is_timeout() || net.is_connect() => {
            let jitter_ms = rand::thread_rng().gen_range(0..=500);
            Some(backoff_delay(attempt) + Duration::from_millis(jitter_ms))
        }
        _ => None,
    }
}

fn backoff_delay(attempt: usize) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1)).min(16);
    UPLOAD_RETRY_BASE_DELAY
        .saturating_mul(factor)
        .min(UPLOAD_RETRY_MAX_DELAY)
}

pub fn is_message_not_modified(err: &RequestError) -> bool {
    matches!(err, RequestError::Api(ApiError::MessageNotModified))
}

fn upload_caption(title: Option<&str>) -> String {
    match title {
        Some(title) if !title.trim().is_empty() => format!("✅ Downloaded: {}", title.trim()),
        _ => "✅ Downloaded".to_string(),
    }
}

pub fn upload_file_name(title: Option<&str>, path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("video");
    let name: String = title
        .unwrap_or(stem)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let name = name.trim();
    let name = if name.is_empty() { "video" } else { name };
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
    format!("{name}.{ext}")
}
