use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Form, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Semaphore,
    time::{Duration, timeout},
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    downloads_root: PathBuf,
    downloader_bin: String,
    job_timeout: Duration,
    cleanup_grace: Duration,
    download_semaphore: Arc<Semaphore>,
}

const DOWNLOADER_BIN: &str = "yt-dlp";
const JOB_TIMEOUT_SECONDS: u64 = 600;
const CLEANUP_GRACE_SECONDS: u64 = 5;
const STALE_WORK_DIR_SECONDS: u64 = 60 * 60;
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

const ALLOWED_DOMAINS: [&str; 7] = [
    "youtube.com",
    "youtu.be",
    "tiktok.com",
    "vt.tiktok.com",
    "instagram.com",
    "twitter.com",
    "x.com",
];

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>mediagrab</title>
<style>
  body {
    font-family: system-ui, sans-serif;
    background: #14171c;
    color: #e8e8e8;
    display: flex;
    align-items: center;
    justify-content: center;
    height: 100vh;
    margin: 0;
  }
  .card {
    background: #1e232b;
    padding: 32px 36px;
    border-radius: 12px;
    width: 90%;
    max-width: 480px;
    text-align: center;
  }
  h1 { margin: 0 0 18px; color: #4cc2ff; font-size: 24px; }
  input, select, button {
    width: 100%;
    box-sizing: border-box;
    padding: 11px;
    margin-bottom: 14px;
    border: none;
    border-radius: 7px;
    font-size: 15px;
  }
  button {
    background: #4cc2ff;
    color: #14171c;
    cursor: pointer;
    font-weight: 600;
  }
  button:hover { background: #7ad2ff; }
</style>
</head>
<body>
  <div class="card">
    <h1>mediagrab</h1>
    <form method="post" action="/download">
      <input type="text" name="url" placeholder="Paste a YouTube / TikTok / Instagram / X link" required>
      <select name="format_choice">
        <option value="mp4" selected>Video (MP4)</option>
        <option value="mp3">Audio (MP3)</option>
      </select>
      <button type="submit">Download</button>
    </form>
  </div>
</body>
</html>
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadMode {
    Video,
    Audio,
}

impl DownloadMode {
    fn from_choice(choice: Option<&str>) -> Self {
        match choice.map(str::trim) {
            Some("mp3") => Self::Audio,
            _ => Self::Video,
        }
    }

    fn expected_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Video => &["mp4", "mkv", "webm", "mov"],
            Self::Audio => &["mp3"],
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadForm {
    url: Option<String>,
    format_choice: Option<String>,
}

#[derive(Debug)]
struct DownloadRequest {
    url: String,
    mode: DownloadMode,
}

#[derive(Debug)]
struct JobOutcome {
    exit_code: Option<i32>,
    stderr: String,
}

impl JobOutcome {
    fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn tool_failure(stderr: &str) -> Self {
        Self::internal(format!("Download failed:\n\n{stderr}"))
    }

    fn timeout() -> Self {
        Self::internal("The download timed out before it finished. Try another URL or format.")
    }

    fn result_missing() -> Self {
        Self::internal("Could not locate the downloaded file.")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl AppState {
    fn from_env(downloads_root: PathBuf) -> Self {
        let max_concurrent_jobs = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);

        Self {
            downloads_root,
            downloader_bin: DOWNLOADER_BIN.to_string(),
            job_timeout: Duration::from_secs(JOB_TIMEOUT_SECONDS),
            cleanup_grace: Duration::from_secs(CLEANUP_GRACE_SECONDS),
            download_semaphore: Arc::new(Semaphore::new(max_concurrent_jobs)),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mediagrab=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let downloads_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("downloads");
    tokio::fs::create_dir_all(&downloads_root)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not create the downloads root: {error}"))
        })?;

    let state = AppState::from_env(downloads_root);
    sweep_stale_work_dirs(
        &state.downloads_root,
        Duration::from_secs(STALE_WORK_DIR_SECONDS),
    )
    .await;

    let app = Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/download", post(download))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("mediagrab listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn download(
    State(state): State<AppState>,
    Form(form): Form<DownloadForm>,
) -> Result<Response, ApiError> {
    let url = form.url.as_deref().unwrap_or("").trim();
    if url.is_empty() {
        return Err(ApiError::invalid_input(
            "Enter a media URL before downloading.",
        ));
    }
    if !is_allowed_url(url) {
        return Err(ApiError::invalid_input(
            "That URL is not supported. Paste a YouTube, TikTok, Instagram, or X link.",
        ));
    }

    let request = DownloadRequest {
        url: url.to_string(),
        mode: DownloadMode::from_choice(form.format_choice.as_deref()),
    };

    let _permit = state
        .download_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("Could not reserve download capacity."))?;

    let work_dir = state.downloads_root.join(Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&work_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not prepare the working directory: {error}"))
    })?;
    let cleanup = CleanupGuard::new(work_dir.clone(), state.cleanup_grace);

    info!("downloading {:?} as {:?}", request.url, request.mode);
    let outcome = run_downloader(&state, &request, &work_dir).await?;
    if !outcome.succeeded() {
        warn!(
            "downloader exited with {:?} for {:?}",
            outcome.exit_code, request.url
        );
        return Err(ApiError::tool_failure(&outcome.stderr));
    }

    let result = locate_result(&work_dir, request.mode).await?;
    respond_with_file(result, cleanup).await
}

fn is_allowed_url(input: &str) -> bool {
    let parsed = match Url::parse(input) {
        Ok(url) => url,
        Err(_) => return false,
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let host = match parsed.host_str() {
        Some(host) => host.to_ascii_lowercase(),
        None => return false,
    };

    ALLOWED_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}

fn build_downloader_args(request: &DownloadRequest, work_dir: &Path) -> Vec<String> {
    let output_template = format!("{}/%(title)s.%(ext)s", work_dir.to_string_lossy());

    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-o".to_string(),
        output_template,
    ];

    match request.mode {
        DownloadMode::Video => {
            args.push("-f".to_string());
            args.push("bestvideo+bestaudio/best".to_string());
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
        DownloadMode::Audio => {
            args.push("-f".to_string());
            args.push("bestaudio/best".to_string());
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
        }
    }

    args.push(request.url.clone());
    args
}

async fn run_downloader(
    state: &AppState,
    request: &DownloadRequest,
    work_dir: &Path,
) -> Result<JobOutcome, ApiError> {
    let args = build_downloader_args(request, work_dir);
    debug!("running {} {:?}", state.downloader_bin, args);

    // Timing out drops the future, and kill_on_drop takes the child with it.
    let command_future = Command::new(&state.downloader_bin)
        .args(&args)
        .kill_on_drop(true)
        .output();
    let output = timeout(state.job_timeout, command_future)
        .await
        .map_err(|_| ApiError::timeout())?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(format!(
                    "{} is not installed or not on PATH.",
                    state.downloader_bin
                ))
            } else {
                ApiError::internal(format!("Could not launch the downloader: {error}"))
            }
        })?;

    Ok(JobOutcome {
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

async fn locate_result(work_dir: &Path, mode: DownloadMode) -> Result<PathBuf, ApiError> {
    let mut entries = tokio::fs::read_dir(work_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not open the working directory: {error}"))
    })?;

    let mut best: Option<(bool, SystemTime, PathBuf)> = None;

    while let Some(entry) = entries.next_entry().await.map_err(|error| {
        ApiError::internal(format!("Could not list the working directory: {error}"))
    })? {
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("could not stat {:?}: {error}", path);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        // Files with the requested extension outrank auxiliary output such as
        // thumbnails; recency breaks ties within a class.
        let candidate = (matches_requested_format(&path, mode), created, path);
        if best
            .as_ref()
            .is_none_or(|current| (candidate.0, candidate.1) > (current.0, current.1))
        {
            best = Some(candidate);
        }
    }

    best.map(|(_, _, path)| path)
        .ok_or_else(ApiError::result_missing)
}

fn matches_requested_format(path: &Path, mode: DownloadMode) -> bool {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    mode.expected_extensions().contains(&extension.as_str())
}

async fn respond_with_file(path: PathBuf, cleanup: CleanupGuard) -> Result<Response, ApiError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not read the result file: {error}")))?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|error| ApiError::internal(format!("Could not open the result file: {error}")))?;

    // The guard travels with the body, so deletion is scheduled once the
    // response has been fully streamed or abandoned.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _ = &cleanup;
        chunk
    });

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the download size header."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the attachment header."))?,
    );

    Ok((headers, Body::from_stream(stream)).into_response())
}

struct CleanupGuard {
    work_dir: PathBuf,
    grace: Duration,
}

impl CleanupGuard {
    fn new(work_dir: PathBuf, grace: Duration) -> Self {
        Self { work_dir, grace }
    }
}

impl Drop for CleanupGuard {
    // Only ever dropped inside handlers or response bodies, so a runtime is
    // always available for the spawn.
    fn drop(&mut self) {
        let work_dir = std::mem::take(&mut self.work_dir);
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(error) = tokio::fs::remove_dir_all(&work_dir).await
                && error.kind() != ErrorKind::NotFound
            {
                info!("could not remove work directory {:?}: {error}", work_dir);
            }
        });
    }
}

async fn sweep_stale_work_dirs(downloads_root: &Path, older_than: Duration) {
    let mut entries = match tokio::fs::read_dir(downloads_root).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open downloads root for sweeping: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate downloads root: {error}");
                break;
            }
        };

        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let modified_at = metadata.modified().unwrap_or(now);
        if now.duration_since(modified_at).unwrap_or_default() < older_than {
            continue;
        }

        let removal = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        if let Err(error) = removal
            && error.kind() != ErrorKind::NotFound
        {
            warn!("could not remove stale entry {:?}: {error}", path);
        }
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8080".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
