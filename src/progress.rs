use std::sync::Arc;
use tokio::sync::watch;

const MIB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn exceeds(&self, limit: u64) -> bool {
        self.downloaded > limit || self.total.is_some_and(|total| total > limit)
    }

    pub fn percent(&self) -> Option<f64> {
        let total = self.total.filter(|t| *t > 0)?;
        Some((self.downloaded as f64 / total as f64 * 100.0).min(100.0))
    }
}

/// Latest download progress, shared between the process reader and the
/// status-message reporter. Writers never block; readers see only the newest value.
#[derive(Clone)]
pub struct ProgressState {
    tx: Arc<watch::Sender<Option<DownloadProgress>>>,
}

impl ProgressState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn report(&self, progress: DownloadProgress) {
        self.tx.send_replace(Some(progress));
    }

    pub fn latest(&self) -> Option<DownloadProgress> {
        *self.tx.borrow()
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn render_progress(title: Option<&str>, progress: Option<DownloadProgress>) -> String {
    let mut text = match title {
        Some(title) => format!("⬇️ Downloading: {title}\n"),
        None => "⬇️ Downloading video...\n".to_string(),
    };
    let Some(progress) = progress else {
        return text;
    };
    match (progress.percent(), progress.total) {
        (Some(percent), Some(total)) => {
            text.push_str(&format!("⏬ Progress: {percent:.1}%\n"));
            text.push_str(&format!("💾 Size: {:.1}MB", total as f64 / MIB));
        }
        _ => {
            text.push_str(&format!("⏬ Received: {:.1}MB", progress.downloaded as f64 / MIB));
        }
    }
    text
}
