use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use warc_idx::cache::{ArtifactLayout, ArtifactStore, DerivedIndexCache};
use warc_idx::config::Config;
use warc_idx::core::RequestType;
use warc_idx::ledger::RequestLedger;
use warc_idx::scan::ArchiveScanRunner;
use warc_idx::server::socket::{forward_ready_notices, SocketTransport};
use warc_idx::server::{HandlerRegistry, IndexRequestServer};

#[derive(Parser)]
#[command(name = "warc-idx", about = "Derived-index cache and request server")]
struct Args {
    /// Path to the TOML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn make_cache(
    config: &Config,
    request_type: RequestType,
    layout: ArtifactLayout,
    timeout: Duration,
) -> anyhow::Result<Arc<DerivedIndexCache>> {
    let store = ArtifactStore::open(&config.cache_dir, request_type.cache_name(), layout)?;
    let mut runner = ArchiveScanRunner::new(&config.archive_root, layout, timeout);
    if request_type == RequestType::DedupCrawlLog {
        runner = runner.with_mime_filter(&config.dedup_mime_filter, config.dedup_mime_blacklist)?;
    }
    Ok(Arc::new(DerivedIndexCache::new(store, Box::new(runner))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!("starting warc-idx request server");

    // 每种索引一个 cache，注册表启动时建好、之后只读
    let cdx_timeout = Duration::from_secs(config.cdx_scan_timeout_secs);
    let log_timeout = Duration::from_secs(config.crawl_log_scan_timeout_secs);
    let mut registry = HandlerRegistry::new();
    registry.register(
        RequestType::CdxIndex,
        make_cache(&config, RequestType::CdxIndex, ArtifactLayout::SingleFile, cdx_timeout)?,
    );
    registry.register(
        RequestType::DedupCrawlLog,
        make_cache(&config, RequestType::DedupCrawlLog, ArtifactLayout::Directory, log_timeout)?,
    );
    registry.register(
        RequestType::FullCrawlLog,
        make_cache(&config, RequestType::FullCrawlLog, ArtifactLayout::Directory, log_timeout)?,
    );

    let ledger = Arc::new(RequestLedger::open(&config.ledger_dir)?);

    for sock in [&config.request_socket, &config.ready_socket] {
        if let Some(parent) = sock.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (ready_tx, ready_rx) = tokio::sync::mpsc::channel(config.inbound_queue);
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(config.inbound_queue);

    let server = IndexRequestServer::new(
        Arc::new(registry),
        ledger,
        config.max_concurrent_jobs,
        ready_tx,
    );

    // server loop 先 replay ledger，再开始收新请求
    tokio::spawn(server.run(inbound_rx));
    tokio::spawn(forward_ready_notices(ready_rx, config.ready_socket.clone()));

    let transport = SocketTransport::new(
        config.request_socket.to_string_lossy().into_owned(),
        inbound_tx,
    );
    tokio::spawn(transport.run());

    info!(
        "warc-idx ready: requests on {}, max {} concurrent generations",
        config.request_socket.display(),
        config.max_concurrent_jobs
    );

    // 优雅退出：在途请求已持久，重启后自动续跑
    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    Ok(())
}
