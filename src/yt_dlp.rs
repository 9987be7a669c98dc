use crate::{
    config::{Config, YtDlpSettings},
    error::{AppError, DownloadError, ExtractionError},
    progress::{DownloadProgress, ProgressState},
    quality::Format,
};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

const STDERR_TAIL_LINES: usize = 20;
const PROGRESS_PREFIX: &str = "progress:";
const PROGRESS_TEMPLATE: &str =
    "download:progress:%(progress.downloaded_bytes)s:%(progress.total_bytes,progress.total_bytes_estimate)s";

#[derive(Deserialize)]
pub struct YtDlpInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub formats: Vec<YtDlpFormat>,
}

#[derive(Deserialize)]
pub struct YtDlpFormat {
    pub format_id: String,
    pub height: Option<u32>,
    pub tbr: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

impl YtDlpFormat {
    fn into_format(self, duration: Option<f64>) -> Format {
        let filesize = self.filesize.or(self.filesize_approx);
        let bitrate = self
            .tbr
            .filter(|tbr| *tbr > 0.0)
            .or_else(|| bitrate_from_size(filesize, duration));
        Format {
            has_video: self.vcodec.as_deref() != Some("none"),
            has_audio: !matches!(self.acodec.as_deref(), None | Some("none")),
            format_id: self.format_id,
            height: self.height,
            bitrate,
            filesize,
        }
    }
}

fn bitrate_from_size(filesize: Option<u64>, duration: Option<f64>) -> Option<f64> {
    let duration = duration.filter(|d| *d > 0.0)?;
    let kbps = filesize? as f64 * 8.0 / duration / 1000.0;
    (kbps > 0.0).then_some(kbps)
}

/// Title plus the formats available for a video.
#[derive(Clone, Debug)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub formats: Vec<Format>,
}

impl From<YtDlpInfo> for VideoInfo {
    fn from(info: YtDlpInfo) -> Self {
        let duration = info.duration;
        Self {
            title: info.title,
            formats: info
                .formats
                .into_iter()
                .map(|f| f.into_format(duration))
                .collect(),
        }
    }
}

pub struct DownloadRequest {
    pub url: String,
    pub format_id: String,
    pub has_audio: bool,
    pub progress: ProgressState,
    pub cancel: CancellationToken,
}

/// A finished download; the file lives inside its own job directory.
#[derive(Debug)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub size: u64,
    pub job: JobDir,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn fetch_formats(&self, url: &str) -> Result<VideoInfo, ExtractionError>;
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, req: DownloadRequest) -> Result<DownloadedFile, DownloadError>;
}

#[derive(Clone, Copy, Debug)]
pub struct DownloadLimits {
    pub max_bytes: u64,
    pub max_duration: Duration,
}

pub struct YtDlpClient {
    program: String,
    base_args: Vec<String>,
    download_dir: PathBuf,
    limits: DownloadLimits,
}

impl YtDlpClient {
    pub fn from_config(config: &Config) -> Self {
        Self::with_command(
            config.yt_dlp.binary.clone(),
            base_args(&config.yt_dlp),
            config.download_dir.clone(),
            DownloadLimits {
                max_bytes: config.max_download_bytes,
                max_duration: config.max_download_duration,
            },
        )
    }

    /// Runs `program base_args... <yt-dlp args>`.
    pub fn with_command(
        program: impl Into<String>,
        base_args: Vec<String>,
        download_dir: impl Into<PathBuf>,
        limits: DownloadLimits,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            download_dir: download_dir.into(),
            limits,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        cmd
    }
}

fn base_args(settings: &YtDlpSettings) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(client) = &settings.player_client {
        args.push("--extractor-args".to_string());
        args.push(format!("youtube:player_client={client}"));
    }
    if settings.force_ipv4 {
        info!(event = "yt_dlp_force_ipv4");
        args.push("--force-ipv4".to_string());
    }
    args
}

#[async_trait]
impl MediaProvider for YtDlpClient {
    #[instrument(skip(self))]
    async fn fetch_formats(&self, url: &str) -> Result<VideoInfo, ExtractionError> {
        info!(event = "fetch_formats_start", url = %url);
        let output = self
            .command()
            .arg("-J")
            .arg("--no-playlist")
            .arg(url)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                event = "fetch_formats_failed",
                status = %output.status,
                stderr = %stderr.trim()
            );
            return Err(classify_extraction_error(&stderr));
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)?;
        info!(event = "fetch_formats_success", format_count = info.formats.len());
        Ok(info.into())
    }
}

#[async_trait]
impl Downloader for YtDlpClient {
    #[instrument(skip(self, req), fields(url = %req.url, format_id = %req.format_id))]
    async fn download(&self, req: DownloadRequest) -> Result<DownloadedFile, DownloadError> {
        let job = JobDir::create(&self.download_dir).await?;
        info!(event = "download_start", job = %job.path().display());
        let result = self.run_download(&req, job.path()).await;
        match result {
            Ok(()) => finish_download(job, self.limits.max_bytes).await,
            Err(err) => {
                warn!(event = "download_aborted", error = %err);
                job.remove().await;
                Err(err)
            }
        }
    }
}

impl YtDlpClient {
    async fn run_download(&self, req: &DownloadRequest, job_path: &Path) -> Result<(), DownloadError> {
        let limits = self.limits;
        let deadline = Instant::now() + limits.max_duration;
        let mut child = self
            .command()
            .arg("-f")
            .arg(format_selector(&req.format_id, req.has_audio))
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--max-filesize")
            .arg(limits.max_bytes.to_string())
            .arg("-o")
            .arg(job_path.join("%(id)s.%(ext)s"))
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg(&req.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Failed("missing stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::Failed("missing stderr".into()))?;

        let stderr_task = tokio::spawn(
            async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    trace!(event = "yt_dlp_stderr_line", line = line.as_str());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            }
            .in_current_span(),
        );

        let mut lines = BufReader::new(stdout).lines();
        let read_result = loop {
            tokio::select! {
                _ = req.cancel.cancelled() => break Err(DownloadError::Cancelled),
                _ = time::sleep_until(deadline) => break Err(DownloadError::TimedOut(limits.max_duration)),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(progress) = parse_progress_line(&line) {
                            if progress.exceeds(limits.max_bytes) {
                                break Err(DownloadError::TooLarge { limit: limits.max_bytes });
                            }
                            req.progress.report(progress);
                        } else if line.contains("larger than max-filesize") {
                            break Err(DownloadError::TooLarge { limit: limits.max_bytes });
                        } else {
                            debug!(event = "yt_dlp_stdout_line", line = line.as_str());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(DownloadError::Io(err)),
                },
            }
        };

        if let Err(err) = read_result {
            stop_child(&mut child).await;
            stderr_task.abort();
            return Err(err);
        }

        let status = tokio::select! {
            _ = req.cancel.cancelled() => None,
            status = time::timeout_at(deadline, child.wait()) => Some(status),
        };
        let status = match status {
            None => {
                stop_child(&mut child).await;
                return Err(DownloadError::Cancelled);
            }
            Some(Err(_elapsed)) => {
                stop_child(&mut child).await;
                return Err(DownloadError::TimedOut(limits.max_duration));
            }
            Some(Ok(status)) => status?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            error!(event = "download_failed_status", status = %status, stderr = %stderr);
            return Err(classify_download_error(&stderr));
        }
        Ok(())
    }
}

async fn stop_child(child: &mut Child) {
    if let Err(err) = child.kill().await {
        debug!(event = "yt_dlp_kill_failed", error = %err);
    }
}

async fn finish_download(job: JobDir, max_bytes: u64) -> Result<DownloadedFile, DownloadError> {
    let output = match find_output_file(job.path()).await {
        Ok(Some(found)) => found,
        Ok(None) => {
            job.remove().await;
            return Err(DownloadError::NoOutput);
        }
        Err(err) => {
            job.remove().await;
            return Err(err.into());
        }
    };
    let (path, size) = output;
    if size > max_bytes {
        warn!(event = "download_too_large", size, max_bytes);
        job.remove().await;
        return Err(DownloadError::TooLarge { limit: max_bytes });
    }
    info!(event = "download_complete", path = %path.display(), size);
    Ok(DownloadedFile { path, size, job })
}

/// Largest finished file in the job directory.
async fn find_output_file(dir: &Path) -> io::Result<Option<(PathBuf, u64)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut best: Option<(PathBuf, u64)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| matches!(ext, "part" | "ytdl" | "temp"));
        let meta = entry.metadata().await?;
        if !meta.is_file() || is_partial {
            continue;
        }
        if best.as_ref().map_or(true, |(_, size)| meta.len() > *size) {
            best = Some((path, meta.len()));
        }
    }
    Ok(best)
}

pub fn format_selector(format_id: &str, has_audio: bool) -> String {
    if format_id.is_empty() {
        "bestvideo+bestaudio/best".to_string()
    } else if has_audio {
        format!("{format_id}/best")
    } else {
        format!("{format_id}+bestaudio[ext=m4a]/{format_id}+bestaudio/best")
    }
}

pub fn parse_progress_line(line: &str) -> Option<DownloadProgress> {
    let payload = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let (downloaded, total) = payload.split_once(':')?;
    let downloaded = parse_byte_count(downloaded)?;
    Some(DownloadProgress {
        downloaded,
        total: parse_byte_count(total),
    })
}

fn parse_byte_count(raw: &str) -> Option<u64> {
    let value: f64 = raw.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then(|| value as u64)
}

pub fn classify_extraction_error(stderr: &str) -> ExtractionError {
    let lower = stderr.to_lowercase();
    let detail = last_error_line(stderr);
    if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        ExtractionError::Unsupported(detail)
    } else if lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("is not available")
        || lower.contains("confirm your age")
    {
        ExtractionError::Unavailable(detail)
    } else {
        ExtractionError::Upstream(detail)
    }
}

pub fn classify_download_error(stderr: &str) -> DownloadError {
    let lower = stderr.to_lowercase();
    let detail = last_error_line(stderr);
    if lower.contains("no space left on device") {
        DownloadError::DiskFull
    } else if lower.contains("requested format is not available") {
        DownloadError::FormatUnavailable(detail)
    } else if lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("network is unreachable")
        || lower.contains("temporary failure in name resolution")
    {
        DownloadError::Network(detail)
    } else {
        DownloadError::Failed(detail)
    }
}

fn last_error_line(stderr: &str) -> String {
    let lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty());
    lines
        .clone()
        .filter(|l| l.starts_with("ERROR"))
        .last()
        .or_else(|| lines.last())
        .unwrap_or("unknown error")
        .to_string()
}

/// Per-download working directory. Removed by `remove`, or on drop as a fallback.
#[derive(Debug)]
pub struct JobDir {
    path: PathBuf,
    removed: bool,
}

impl JobDir {
    pub async fn create(root: &Path) -> io::Result<Self> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        let path = root.join(format!("job-{suffix}"));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path, removed: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(event = "job_dir_removed", path = %self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(event = "job_dir_remove_failed", path = %self.path.display(), error = %err),
        }
        self.removed = true;
    }
}

impl Drop for JobDir {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Runs `<tool> <version_arg>` and returns the first line of its output.
pub async fn check_tool(tool: &str, version_arg: &str) -> Result<String, AppError> {
    let missing = |reason: String| AppError::MissingTool {
        tool: tool.to_string(),
        reason,
    };
    let output = Command::new(tool)
        .arg(version_arg)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| missing(e.to_string()))?;
    if !output.status.success() {
        return Err(missing(format!("exited with {}", output.status)));
    }
    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    info!(event = "tool_available", tool, version = %version);
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ytdlp_json() {
        let json = r#"{
            "title": "Sample",
            "duration": 100.0,
            "formats": [
                {"format_id": "140", "acodec": "mp4a.40.2", "vcodec": "none", "tbr": 129.5, "filesize": 1000},
                {"format_id": "137", "height": 1080, "vcodec": "avc1", "acodec": "none", "filesize_approx": 125000},
                {"format_id": "18", "height": 360, "vcodec": "avc1", "acodec": "mp4a", "tbr": 500.0}
            ]
        }"#;
        let info: VideoInfo = serde_json::from_str::<YtDlpInfo>(json).unwrap().into();
        assert_eq!(info.title.as_deref(), Some("Sample"));
        assert_eq!(info.formats.len(), 3);

        let audio = &info.formats[0];
        assert!(!audio.has_video);
        assert!(audio.has_audio);

        let hd = &info.formats[1];
        assert!(hd.has_video);
        assert!(!hd.has_audio);
        assert_eq!(hd.filesize, Some(125000));
        // 125000 bytes over 100s = 10 kbps
        assert_eq!(hd.bitrate, Some(10.0));

        assert!(info.formats[2].has_audio);
    }

    #[test]
    fn missing_formats_field_is_empty() {
        let info: YtDlpInfo = serde_json::from_str(r#"{"title": null}"#).unwrap();
        assert!(info.formats.is_empty());
    }

    #[test]
    fn selector_merges_best_audio() {
        assert_eq!(
            format_selector("137", false),
            "137+bestaudio[ext=m4a]/137+bestaudio/best"
        );
        assert_eq!(format_selector("18", true), "18/best");
        assert_eq!(format_selector("", false), "bestvideo+bestaudio/best");
    }

    #[test]
    fn progress_lines() {
        assert_eq!(
            parse_progress_line("progress:1024:4096"),
            Some(DownloadProgress {
                downloaded: 1024,
                total: Some(4096)
            })
        );
        assert_eq!(
            parse_progress_line("progress:10:NA"),
            Some(DownloadProgress {
                downloaded: 10,
                total: None
            })
        );
        assert_eq!(
            parse_progress_line("  progress:10:2048.7"),
            Some(DownloadProgress {
                downloaded: 10,
                total: Some(2048)
            })
        );
        assert_eq!(parse_progress_line("[download] Destination: x.mp4"), None);
        assert_eq!(parse_progress_line("progress:NA:100"), None);
    }

    #[test]
    fn classifies_errors() {
        assert!(matches!(
            classify_extraction_error("ERROR: Unsupported URL: https://example.com"),
            ExtractionError::Unsupported(_)
        ));
        assert!(matches!(
            classify_extraction_error("ERROR: [youtube] abc: Private video. Sign in"),
            ExtractionError::Unavailable(_)
        ));
        assert!(matches!(
            classify_extraction_error("WARNING: x\nERROR: HTTP Error 500"),
            ExtractionError::Upstream(ref d) if d == "ERROR: HTTP Error 500"
        ));
        assert!(matches!(
            classify_download_error("ERROR: unable to write data: [Errno 28] No space left on device"),
            DownloadError::DiskFull
        ));
        assert!(matches!(
            classify_download_error("ERROR: [youtube] abc: Requested format is not available"),
            DownloadError::FormatUnavailable(_)
        ));
        assert!(matches!(
            classify_download_error("ERROR: Read timed out."),
            DownloadError::Network(_)
        ));
        assert!(matches!(classify_download_error(""), DownloadError::Failed(ref d) if d == "unknown error"));
    }

    #[tokio::test]
    async fn job_dir_is_removed_explicitly_and_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let job = JobDir::create(root.path()).await.unwrap();
        let path = job.path().to_path_buf();
        tokio::fs::write(path.join("video.mp4"), b"data").await.unwrap();
        job.remove().await;
        assert!(!path.exists());

        let job = JobDir::create(root.path()).await.unwrap();
        let path = job.path().to_path_buf();
        tokio::fs::write(path.join("video.mp4.part"), b"data").await.unwrap();
        drop(job);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn picks_largest_finished_file() {
        let root = tempfile::tempdir().unwrap();
        tokio::fs::write(root.path().join("a.mp4"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(root.path().join("b.mp4"), vec![0u8; 20]).await.unwrap();
        tokio::fs::write(root.path().join("c.mp4.part"), vec![0u8; 50]).await.unwrap();
        let (path, size) = find_output_file(root.path()).await.unwrap().unwrap();
        assert_eq!(path, root.path().join("b.mp4"));
        assert_eq!(size, 20);
    }

    #[cfg(unix)]
    mod fake_binary {
        use super::*;

        // Stands in for yt-dlp: resolves the -o template, writes `$SIZE` bytes
        // there, prints one progress line claiming `$TOTAL` bytes, then lingers.
        const FAKE_YT_DLP: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
file=$(printf '%s' "$out" | sed 's/%(id)s/abc123/; s/%(ext)s/mp4/')
head -c "$SIZE" /dev/zero > "$file"
echo "progress:$SIZE:$TOTAL"
sleep "$LINGER"
"#;

        fn client(root: &Path, size: u64, total: u64, linger: u64, limits: DownloadLimits) -> YtDlpClient {
            let script = format!("SIZE={size} TOTAL={total} LINGER={linger}\n{FAKE_YT_DLP}");
            YtDlpClient::with_command(
                "sh",
                vec!["-c".into(), script, "fake-yt-dlp".into()],
                root.join("downloads"),
                limits,
            )
        }

        fn request() -> DownloadRequest {
            DownloadRequest {
                url: "https://youtu.be/abc123".into(),
                format_id: "137".into(),
                has_audio: false,
                progress: ProgressState::new(),
                cancel: CancellationToken::new(),
            }
        }

        async fn leftover_files(dir: &Path) -> usize {
            let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
                return 0;
            };
            let mut count = 0;
            while let Ok(Some(_)) = entries.next_entry().await {
                count += 1;
            }
            count
        }

        #[tokio::test]
        async fn oversized_download_is_aborted_and_cleaned_up() {
            let root = tempfile::tempdir().unwrap();
            let limits = DownloadLimits {
                max_bytes: 1024,
                max_duration: Duration::from_secs(30),
            };
            let client = client(root.path(), 512, 1_000_000, 30, limits);
            let started = std::time::Instant::now();
            let err = client.download(request()).await.unwrap_err();
            assert!(matches!(err, DownloadError::TooLarge { limit: 1024 }));
            assert!(started.elapsed() < Duration::from_secs(20));
            assert_eq!(leftover_files(&root.path().join("downloads")).await, 0);
        }

        #[tokio::test]
        async fn oversized_output_file_is_rejected() {
            let root = tempfile::tempdir().unwrap();
            let limits = DownloadLimits {
                max_bytes: 1024,
                max_duration: Duration::from_secs(30),
            };
            // Progress claims a small size but the file on disk is too big.
            let client = client(root.path(), 4096, 100, 0, limits);
            let err = client.download(request()).await.unwrap_err();
            assert!(matches!(err, DownloadError::TooLarge { .. }));
            assert_eq!(leftover_files(&root.path().join("downloads")).await, 0);
        }

        #[tokio::test]
        async fn successful_download_reports_progress() {
            let root = tempfile::tempdir().unwrap();
            let limits = DownloadLimits {
                max_bytes: 1 << 20,
                max_duration: Duration::from_secs(30),
            };
            let client = client(root.path(), 2048, 2048, 0, limits);
            let req = request();
            let progress = req.progress.clone();
            let file = client.download(req).await.unwrap();
            assert_eq!(file.size, 2048);
            assert!(file.path.ends_with("abc123.mp4"));
            assert_eq!(
                progress.latest(),
                Some(DownloadProgress {
                    downloaded: 2048,
                    total: Some(2048)
                })
            );
            let job_path = file.job.path().to_path_buf();
            file.job.remove().await;
            assert!(!job_path.exists());
        }

        #[tokio::test]
        async fn time_limit_kills_the_download() {
            let root = tempfile::tempdir().unwrap();
            let limits = DownloadLimits {
                max_bytes: 1 << 20,
                max_duration: Duration::from_millis(300),
            };
            let client = client(root.path(), 16, 16, 30, limits);
            let err = client.download(request()).await.unwrap_err();
            assert!(matches!(err, DownloadError::TimedOut(_)));
            assert_eq!(leftover_files(&root.path().join("downloads")).await, 0);
        }

        #[tokio::test]
        async fn cancellation_stops_the_download() {
            let root = tempfile::tempdir().unwrap();
            let limits = DownloadLimits {
                max_bytes: 1 << 20,
                max_duration: Duration::from_secs(30),
            };
            let client = client(root.path(), 16, 16, 30, limits);
            let req = request();
            let cancel = req.cancel.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            });
            let err = client.download(req).await.unwrap_err();
            assert!(matches!(err, DownloadError::Cancelled));
            assert_eq!(leftover_files(&root.path().join("downloads")).await, 0);
        }

        #[tokio::test]
        async fn failing_extractor_maps_stderr() {
            let root = tempfile::tempdir().unwrap();
            let client = YtDlpClient::with_command(
                "sh",
                vec![
                    "-c".into(),
                    "echo 'ERROR: Unsupported URL: x' >&2; exit 1".into(),
                    "fake-yt-dlp".into(),
                ],
                root.path(),
                DownloadLimits {
                    max_bytes: 1,
                    max_duration: Duration::from_secs(5),
                },
            );
            let err = client.fetch_formats("https://example.com").await.unwrap_err();
            assert!(matches!(err, ExtractionError::Unsupported(_)));
        }
    }
}
