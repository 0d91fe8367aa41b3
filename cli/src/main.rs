//! Binary entry point: parse flags, load configuration, initialize
//! tracing, wire store -> engines -> orchestrator -> server, and run one
//! of the two transports.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mesnada_cli::server::{http, stdio, McpServer};
use mesnada_core::agent::Spawner;
use mesnada_core::config::{Config, LoggingConfig};
use mesnada_core::orchestrator::{Options, Orchestrator};
use mesnada_core::store::FileStore;
use mesnada_engines::EngineManager;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "mesnada", version, about = "MCP orchestrator for CLI coding agents")]
struct Args {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server host (default: 127.0.0.1)
    #[arg(long)]
    host: Option<String>,

    /// Server port (default: 8765)
    #[arg(long)]
    port: Option<u16>,

    /// Path to task store file
    #[arg(long)]
    store: Option<PathBuf>,

    /// Directory for agent logs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Maximum parallel agents
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Use stdio transport instead of HTTP
    #[arg(long)]
    stdio: bool,

    /// Initialize default config and exit
    #[arg(long)]
    init: bool,
}

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[tokio::main]
async fn main() {
    let exit = match real_main().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            1
        }
    };
    std::process::exit(exit);
}

async fn real_main() -> anyhow::Result<i32> {
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        cfg.server.host = host;
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(store) = args.store {
        cfg.orchestrator.store_path = store.to_string_lossy().into_owned();
    }
    if let Some(log_dir) = args.log_dir {
        cfg.orchestrator.log_dir = log_dir.to_string_lossy().into_owned();
    }
    if let Some(max_parallel) = args.max_parallel {
        cfg.orchestrator.max_parallel = max_parallel;
    }

    if args.init {
        let path = cfg.save(args.config.as_deref())?;
        println!("Configuration initialized at {}", path.display());
        return Ok(0);
    }

    init_tracing(&cfg.logging).map_err(|e| anyhow::anyhow!(e))?;

    // Load error on a present-but-corrupt store is fatal: the operator
    // must intervene rather than silently start empty.
    let store = FileStore::open(&cfg.orchestrator.store_path)?;

    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let manager: Arc<dyn Spawner> = Arc::new(EngineManager::new(
        cfg.orchestrator.log_dir.clone(),
        completion_tx,
    )?);

    let orchestrator = Orchestrator::new(
        Options {
            max_parallel: cfg.orchestrator.max_parallel,
            default_engine: cfg.default_engine(),
            default_mcp_config: cfg.orchestrator.default_mcp_config.clone(),
        },
        store,
        manager,
        completion_rx,
    );

    let addr: SocketAddr = cfg.address().parse()?;
    let server = McpServer::new(orchestrator.clone(), cfg, VERSION);

    if args.stdio {
        info!("mesnada {VERSION} starting in stdio mode");
        stdio::run(server).await?;
    } else {
        info!("mesnada {VERSION} starting");
        info!("MCP endpoint: http://{addr}/mcp");
        info!("SSE endpoint: http://{addr}/mcp/sse");
        info!("Health check: http://{addr}/health");
        http::serve(server, addr).await?;
    }

    info!("shutting down");
    orchestrator.shutdown().await;
    Ok(0)
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), String> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::try_new(logging.level.clone()).map_err(|e| e.to_string())?,
    };

    let mut maybe_writer = None;
    if logging.file {
        let dir = match logging
            .directory
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(d) => PathBuf::from(d),
            None => std::env::temp_dir().join("mesnada"),
        };
        std::fs::create_dir_all(&dir).map_err(|e| format!("create log dir failed: {e}"))?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(3)
            .filename_prefix("mesnada.log")
            .build(dir)
            .map_err(|e| e.to_string())?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);
        maybe_writer = Some(non_blocking);
    }

    if !logging.console && maybe_writer.is_none() {
        return Err("logging disabled for both console and file".to_string());
    }

    // Logs go to stderr: stdout belongs to the stdio transport.
    let console_layer = logging.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
    });

    let file_layer = maybe_writer.map(|w| {
        tracing_subscriber::fmt::layer()
            .with_writer(w)
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}
