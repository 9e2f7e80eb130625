use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use media_grabber::core::connectivity::{ConnectionStatus, ConnectivityProbe, SiteConnectivityChecker};
use media_grabber::core::engine::{BatchHandle, BatchSummary, DownloadOrchestrator, EngineConfig};
use media_grabber::core::events::{channel, EngineEvent, EventReceiver};
use media_grabber::core::model::{BatchId, DownloadItem, DownloadStatus, ItemId};
use media_grabber::core::repository::DownloadRepository;
use media_grabber::core::transfer::FileTransferService;
use media_grabber::plugins::http::driver::{HttpClient, ReqwestClient};
use media_grabber::plugins::photo::api::{InstagramWebApi, PhotoApi};
use media_grabber::plugins::photo::auth::AuthenticationManager;
use media_grabber::plugins::photo::strategy::PhotoNetworkStrategy;
use media_grabber::plugins::pin::strategy::ImagePinStrategy;
use media_grabber::plugins::registry::{DownloadCliConfig, PlatformStrategies, PluginRegistry, StrategyRouter};
use media_grabber::plugins::shortpost::strategy::ShortPostStrategy;
use media_grabber::plugins::video::audio::FfmpegAudioExtractor;
use media_grabber::plugins::video::extractor::YtDlpExtractor;
use media_grabber::plugins::video::strategy::VideoSiteStrategy;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "media-grabber.log";

fn build_cli(registry: &PluginRegistry) -> Command {
    let download = Command::new("download")
        .about("Download media from video, short-post, photo and pin links")
        .arg(
            Arg::new("links")
                .help("Links to download")
                .action(ArgAction::Append)
                .num_args(1..)
                .required(true),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .help("Output name for the link at the same position (repeatable)")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Download root (defaults to the user's Downloads folder)")
                .num_args(1),
        )
        .arg(
            Arg::new("concurrency")
                .long("concurrency")
                .help("Max items downloading at once")
                .default_value("3")
                .num_args(1),
        );

    let download = registry.augment_download_command(download);

    let check = Command::new("check")
        .about("Probe connectivity to every supported service")
        .arg(
            Arg::new("timeout_secs")
                .long("timeout-secs")
                .help("Per-probe timeout in seconds")
                .default_value("5")
                .num_args(1),
        );

    Command::new("media-grabber")
        .about("Media downloader for video, short-post, photo and pin sites")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log_file")
                .long("log-file")
                .help("Append logs to this file instead of the default location")
                .global(true)
                .num_args(1),
        )
        .subcommand(download)
        .subcommand(check)
}

fn default_log_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("media-grabber"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(LOG_FILE_NAME)
}

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Full log to the file; only warnings on stderr so progress bars stay readable.
fn init_logging(log_file: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let path = log_file.unwrap_or_else(default_log_path);
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)).with_filter(filter_or("info")))
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter_or("warn")))
        .try_init()
        .context("install tracing subscriber")?;
    Ok(path)
}

/// Label for a link when `--name` is not given: the video id, else the last path segment, else the host.
fn derive_name(link: &str) -> String {
    let Ok(u) = url::Url::parse(link) else {
        return "download".to_string();
    };
    if let Some((_, v)) = u.query_pairs().find(|(k, _)| k == "v") {
        return v.into_owned();
    }
    u.path_segments()
        .and_then(|mut s| s.rfind(|seg| !seg.is_empty()).map(str::to_string))
        .or_else(|| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "download".to_string())
}

fn build_router(cfg: &DownloadCliConfig, engine_cfg: &EngineConfig, auth: Arc<AuthenticationManager>, http: Arc<dyn HttpClient>, probe: Arc<dyn ConnectivityProbe>) -> StrategyRouter {
    let transfer = FileTransferService::new(http.clone()).with_headers(cfg.headers.clone());
    let video = VideoSiteStrategy::new(
        Arc::new(YtDlpExtractor::default()),
        probe.clone(),
        Arc::new(FfmpegAudioExtractor::default()),
        engine_cfg.retry,
    )
    .with_user_agent(cfg.driver_ctx.user_agent.clone());

    StrategyRouter::with_defaults(PlatformStrategies {
        video: Arc::new(video),
        short_post: Arc::new(ShortPostStrategy::new(http.clone(), transfer.clone(), probe.clone())),
        photo: Arc::new(PhotoNetworkStrategy::new(auth, transfer.clone(), probe.clone())),
        image_pin: Arc::new(ImagePinStrategy::new(http, transfer, probe)),
    })
}

async fn run_download(registry: &PluginRegistry, m: &ArgMatches) -> anyhow::Result<()> {
    let mut cfg = DownloadCliConfig::default();
    registry.apply_download_matches(m, &mut cfg)?;

    let mut engine_cfg = EngineConfig::default();
    if let Some(dir) = m.get_one::<String>("out_dir") {
        engine_cfg.download_root = PathBuf::from(dir);
    }
    if let Some(s) = m.get_one::<String>("concurrency") {
        engine_cfg.max_concurrent = s.parse().context("--concurrency")?;
    }
    tokio::fs::create_dir_all(&engine_cfg.download_root)
        .await
        .with_context(|| format!("create download root {}", engine_cfg.download_root.display()))?;

    let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(cfg.driver_ctx.clone())?);
    let probe: Arc<dyn ConnectivityProbe> =
        Arc::new(SiteConnectivityChecker::new(http.clone(), Duration::from_secs(cfg.driver_ctx.timeout_secs)));
    let photo_api: Arc<dyn PhotoApi> = Arc::new(InstagramWebApi::new(&cfg.driver_ctx)?);
    let auth = Arc::new(AuthenticationManager::new(photo_api).with_probe(probe.clone()));
    if let (Some(user), Some(pass)) = (&cfg.photo_username, &cfg.photo_password) {
        if let Err(e) = auth.login(user, pass).await {
            eprintln!("photo network login failed: {}", e);
        }
    }

    let router = build_router(&cfg, &engine_cfg, auth, http, probe);
    let repo = Arc::new(DownloadRepository::new());
    let (tx, rx) = channel(256);
    let engine = DownloadOrchestrator::new(repo.clone(), router, engine_cfg, tx);

    let links: Vec<String> = m.get_many::<String>("links").into_iter().flatten().cloned().collect();
    let names: Vec<String> = m.get_many::<String>("name").into_iter().flatten().cloned().collect();
    let mut labels: HashMap<ItemId, String> = HashMap::new();
    let mut rejected = 0usize;
    for (i, link) in links.iter().enumerate() {
        let name = names.get(i).cloned().unwrap_or_else(|| derive_name(link));
        match DownloadItem::new(name.clone(), link.clone(), cfg.options.clone()) {
            Ok(item) => {
                labels.insert(item.id, name);
                repo.add(item);
            }
            Err(e) => {
                rejected += 1;
                eprintln!("skipping {}: {}", link, e);
            }
        }
    }
    if repo.is_empty() {
        anyhow::bail!("no valid links to download");
    }

    let batch = engine.start();
    let ui = tokio::spawn(render_progress(rx, batch.batch_id, labels));
    let interrupt = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = wait_or_interrupt(&engine, batch, interrupt).await;
    if let Err(e) = ui.await {
        tracing::warn!(error = %e, "progress display task failed");
    }

    println!();
    println!("Summary:");
    for item in repo.get_all() {
        match item.status {
            DownloadStatus::Failed => println!(
                "- {} [{:?}] {}: {}",
                item.name,
                item.status,
                item.url,
                item.error_message.unwrap_or_default()
            ),
            _ => println!("- {} [{:?}] {}", item.name, item.status, item.url),
        }
    }
    println!(
        "completed={} failed={} cancelled={} rejected={}",
        summary.completed, summary.failed, summary.cancelled, rejected
    );

    if summary.failed > 0 || rejected > 0 {
        anyhow::bail!("{} download(s) did not complete", summary.failed + rejected);
    }
    Ok(())
}

/// Waits for the batch; if `interrupt` fires first, cancels and waits for the
/// running items to settle.
async fn wait_or_interrupt<F>(engine: &DownloadOrchestrator, batch: BatchHandle, interrupt: F) -> BatchSummary
where
    F: Future<Output = ()>,
{
    let wait = batch.wait();
    tokio::pin!(wait);
    tokio::select! {
        summary = &mut wait => summary,
        _ = interrupt => {
            eprintln!("interrupted, cancelling remaining downloads");
            engine.cancel();
            wait.await
        }
    }
}

/// Consumes engine events until the batch finishes.
async fn render_progress(mut rx: EventReceiver, batch_id: BatchId, labels: HashMap<ItemId, String>) {
    let mp = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:.bold} {bar:40.cyan/blue} {pos:>3}% {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut bars: HashMap<ItemId, ProgressBar> = HashMap::new();

    while let Some(evt) = rx.recv().await {
        match evt {
            EngineEvent::BatchStarted { items, .. } => {
                let _ = mp.println(format!("Starting {} download(s)", items));
            }
            EngineEvent::BatchFinished { batch_id: id, .. } if id == batch_id => break,
            EngineEvent::BatchFinished { .. } => {}
            EngineEvent::ItemStatusChanged { item_id, status } => {
                let pb = bars.entry(item_id).or_insert_with(|| {
                    let pb = mp.add(ProgressBar::new(100));
                    pb.set_style(style.clone());
                    pb.set_prefix(labels.get(&item_id).cloned().unwrap_or_else(|| item_id.to_string()));
                    pb
                });
                match status {
                    DownloadStatus::Completed => {
                        pb.set_position(100);
                        pb.finish_with_message("done");
                    }
                    DownloadStatus::Failed => pb.abandon_with_message("failed"),
                    DownloadStatus::Cancelled => pb.abandon_with_message("cancelled"),
                    other => pb.set_message(format!("{:?}", other).to_lowercase()),
                }
            }
            EngineEvent::Progress { item_id, progress, speed_bps } => {
                if let Some(pb) = bars.get(&item_id) {
                    pb.set_position(progress.clamp(0.0, 100.0) as u64);
                    if speed_bps > 0.0 {
                        pb.set_message(format!("{}/s", HumanBytes(speed_bps as u64)));
                    }
                }
            }
            EngineEvent::Error { scope, message, .. } => {
                let _ = mp.println(format!("[ERR] {}: {}", scope, message));
            }
            EngineEvent::Info { scope, message } => {
                let _ = mp.println(format!("[INFO] {}: {}", scope, message));
            }
        }
    }
}

async fn run_check(m: &ArgMatches) -> anyhow::Result<()> {
    let timeout: u64 = m.get_one::<String>("timeout_secs").map(|s| s.parse()).transpose()?.unwrap_or(5);
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(Default::default())?);
    let checker = SiteConnectivityChecker::new(http, Duration::from_secs(timeout));

    let internet = checker.check_internet().await;
    println!("{:<14} {:?} ({} ms)", "Internet", internet.status, internet.response_time.as_millis());
    for (service, result) in checker.check_all().await {
        let note = match (&result.status, &result.message) {
            (ConnectionStatus::Connected, _) | (_, None) => String::new(),
            (_, Some(m)) => format!(" - {}", m),
        };
        println!(
            "{:<14} {:?} ({} ms){}",
            service.display_name(),
            result.status,
            result.response_time.as_millis(),
            note
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = PluginRegistry::with_defaults();
    let matches = build_cli(&registry).get_matches();

    let log_path = init_logging(matches.get_one::<String>("log_file").map(PathBuf::from))?;
    tracing::info!(log = %log_path.display(), "media-grabber starting");

    match matches.subcommand() {
        Some(("download", m)) => run_download(&registry, m).await,
        Some(("check", m)) => run_check(m).await,
        _ => Ok(()),
    }
}
