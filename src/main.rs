use dotenvy::dotenv;
use futures_util::future::join_all;
use regex::Regex;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tg_siphon::artifact::ArtifactWriter;
use tg_siphon::backfill::BackfillController;
use tg_siphon::config::{Settings, STATS_INTERVAL_SECS, WORKER_JOIN_TIMEOUT_SECS};
use tg_siphon::dispatch::Dispatcher;
use tg_siphon::progress::{FailureLog, ProgressStore, Statistics};
use tg_siphon::resolve;
use tg_siphon::source::MessageSource;
use tg_siphon::telegram::BotApiSource;
use tg_siphon::transfer::{RcloneTransfer, Transfer};
use tg_siphon::uploader::{self, UploadQueue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting the bot token from log output
struct RedactionPatterns {
    token_in_url: Regex,
    bare_token: Regex,
    bot_prefixed: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_in_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            bare_token: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            bot_prefixed: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token_in_url
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .bare_token
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .bot_prefixed
            .replace_all(&output, "$1[MASKED]")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // We return the original buffer length to satisfy the contract,
        // even if the redacted string length differs.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

/// Shared handle to the log file; cloned per log line by the writer layer
#[derive(Clone)]
struct SharedLogFile(Arc<Mutex<std::fs::File>>);

impl Write for SharedLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut file) => file.write(buf),
            Err(_) => Err(io::Error::other("log file lock poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Err(io::Error::other("log file lock poisoned")),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenv().ok();

    let settings = load_settings();
    prepare_directories(&settings);

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns, open_log_file(&settings.log_file));

    info!("starting tg-siphon (event-driven; per-file upload & delete)");
    run(settings).await
}

/// Load settings or exit with code 2, the contract for missing configuration
fn load_settings() -> Settings {
    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    let missing = settings.missing_required();
    if !missing.is_empty() {
        eprintln!("Error: Missing env: {}", missing.join(", "));
        std::process::exit(2);
    }
    settings
}

fn prepare_directories(settings: &Settings) {
    if let Err(e) = std::fs::create_dir_all(&settings.download_dir) {
        eprintln!(
            "Error: cannot create download dir {}: {e}",
            settings.download_dir.display()
        );
        std::process::exit(2);
    }
    if let Some(parent) = settings.log_file.parent() {
        // Logging falls back to stderr-only if this fails.
        let _ = std::fs::create_dir_all(parent);
    }
}

fn open_log_file(path: &Path) -> Option<SharedLogFile> {
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(SharedLogFile(Arc::new(Mutex::new(file)))),
        Err(e) => {
            eprintln!("Warning: cannot open log file {}: {e}", path.display());
            None
        }
    }
}

fn init_logging(patterns: Arc<RedactionPatterns>, log_file: Option<SharedLogFile>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(io::stderr, patterns.clone()));
    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    match log_file {
        Some(file) => {
            let file_layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(
                RedactingMakeWriter::new(move || file.clone(), patterns),
            );
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let channel = settings.target_channel().unwrap_or_default().to_string();
    let token = settings.telegram_token.clone().unwrap_or_default();
    let rclone_dest = settings.rclone_dest.clone().unwrap_or_default();

    let store = ProgressStore::new(settings.state_file.clone());
    let mut state = store.load().await;

    let source = BotApiSource::new(&token);
    // Subscribe before backfill so live events arriving during the replay
    // are buffered, not lost; the shared seen-id guard deduplicates.
    let rx = source.subscribe().await?;

    let target = resolve::resolve_target(&source, &channel).await;

    let queue = Arc::new(UploadQueue::new());
    let transfer: Arc<dyn Transfer> = Arc::new(RcloneTransfer::new(&settings.rclone_args));
    let shutdown = CancellationToken::new();
    let workers = uploader::spawn_workers(
        settings.upload_workers,
        queue.clone(),
        transfer,
        rclone_dest,
        shutdown.clone(),
    );

    let recovered = uploader::scan_local_files(&settings.download_dir, &queue).await;
    if recovered > 0 {
        info!(recovered, "queued leftover files from previous run");
    }

    let dispatcher = Dispatcher::new(
        ArtifactWriter::new(settings.download_dir.clone(), queue.clone()),
        store.clone(),
        FailureLog::new(settings.failed_file.clone()),
    );

    BackfillController::new(
        settings.history_limit,
        settings.batch_size,
        Duration::from_secs_f64(settings.rate_delay_base.max(0.0)),
    )
    .run(&source, &dispatcher, &mut state, &channel)
    .await;

    info!("listening for new messages...");
    ingest_loop(rx, &source, &dispatcher, &mut state, &store, target).await;

    shutdown.cancel();
    store.save(&state).await;
    join_workers(workers).await;
    Ok(())
}

/// Drive live ingestion until a shutdown signal arrives. Dispatch runs on
/// this single task, so the progress state needs no locking.
async fn ingest_loop(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<tg_siphon::source::ChannelMessage>,
    source: &dyn MessageSource,
    dispatcher: &Dispatcher,
    state: &mut tg_siphon::progress::ProgressState,
    store: &ProgressStore,
    target: Option<i64>,
) {
    let period = Duration::from_secs(STATS_INTERVAL_SECS);
    let mut stats_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(msg) => {
                    if let Some(target_id) = target {
                        if msg.chat_id != target_id {
                            continue;
                        }
                    }
                    dispatcher.dispatch(source, state, &msg).await;
                }
                None => {
                    error!("live update stream closed; shutting down");
                    break;
                }
            },
            _ = stats_tick.tick() => {
                log_statistics(state.statistics());
                store.save(state).await;
            }
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("ctrl-c listener failed: {e}");
                }
                info!("shutdown signal received; draining upload queue");
                break;
            }
        }
    }
}

fn log_statistics(stats: &Statistics) {
    info!(
        total = stats.total_processed,
        photos = stats.downloaded_photos,
        videos = stats.downloaded_videos,
        files = stats.downloaded_files,
        text = stats.text_messages,
        failed = stats.failed_downloads,
        "hourly statistics"
    );
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    let timeout = Duration::from_secs(WORKER_JOIN_TIMEOUT_SECS);
    if tokio::time::timeout(timeout, join_all(workers)).await.is_err() {
        warn!("upload workers did not drain within {WORKER_JOIN_TIMEOUT_SECS}s; exiting anyway");
    }
}
