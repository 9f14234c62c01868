mod api;
mod ca;
mod config;
mod crypto;
mod errors;
mod extract;
mod intercept;
mod mux;
mod pii;
mod pipeline;
mod providers;
mod server;
mod session;
mod signatures;
mod stats;
mod storage;
mod substitution;
mod types;
mod workspaces;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use ca::CertificateAuthority;
use config::{Config, LogFormat};
use errors::{GatewayError, EXIT_CONFIG, EXIT_STARTUP};
use pii::RegexRecognizer;
use providers::EndpointRegistry;
use server::GatewayState;
use session::SessionRegistry;
use signatures::SecretFinder;
use stats::Stats;
use storage::{Db, PackageIndex};
use workspaces::{WorkspaceRegistry, DEFAULT_WORKSPACE};

#[derive(Parser, Debug)]
#[command(
    name = "codegate",
    version,
    about = "A local privacy gateway between AI coding assistants and LLM providers",
    long_about = "CodeGate sits on the wire between your coding assistant and the model \
    provider. It redacts secrets and PII before they leave your machine, restores them in \
    the response, flags malicious packages, routes requests per workspace rules, and \
    transparently intercepts TLS for clients that dial providers directly."
)]
struct Args {
    /// Clear-HTTP provider proxy port
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTPS-CONNECT interception port
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Dashboard / management API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warning, info, debug)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<String>,

    /// SQLite database path
    #[arg(long)]
    db_path: Option<String>,

    /// Package-intelligence index path
    #[arg(long)]
    vec_db_path: Option<String>,

    /// Certificates directory
    #[arg(long)]
    certs_dir: Option<String>,
}

fn load_config(args: &Args) -> Result<Config, GatewayError> {
    let mut cfg = Config::load(args.config.as_deref())?;

    // CLI flags win over env and file.
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(port) = args.proxy_port {
        cfg.proxy_port = port;
    }
    if let Some(port) = args.api_port {
        cfg.api_port = port;
    }
    if let Some(host) = &args.host {
        cfg.host = host.clone();
    }
    if let Some(level) = &args.log_level {
        cfg.log_level = serde_yaml::from_str(level)
            .map_err(|_| GatewayError::Config(format!("invalid log level: {level}")))?;
    }
    if let Some(format) = &args.log_format {
        cfg.log_format = serde_yaml::from_str(format)
            .map_err(|_| GatewayError::Config(format!("invalid log format: {format}")))?;
    }
    if let Some(path) = &args.db_path {
        cfg.db_path = path.into();
    }
    if let Some(path) = &args.vec_db_path {
        cfg.vec_db_path = path.into();
    }
    if let Some(dir) = &args.certs_dir {
        cfg.certs_dir = dir.into();
    }
    cfg.validate()?;
    Ok(cfg)
}

fn init_logging(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log_level.as_filter()));
    match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, GatewayError> {
    let addr = format!("{host}:{port}");
    let socket_addr: SocketAddr = tokio::net::lookup_host(&addr)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| GatewayError::Config(format!("cannot resolve {addr}")))?;
    TcpListener::bind(socket_addr)
        .await
        .map_err(|e| GatewayError::Config(format!("cannot bind {addr}: {e}")))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("codegate: {e}");
            std::process::exit(EXIT_CONFIG);
        }
    };
    init_logging(&cfg);

    if let Some(path) = &cfg.signatures_path {
        if let Err(e) = SecretFinder::install_from_yaml(path) {
            error!("{e}");
            std::process::exit(EXIT_CONFIG);
        }
    }

    // Storage. A database path that cannot open is a startup error, not a
    // config error; the port may be fine but the volume is not.
    let db = match Db::open(&cfg.db_path) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => {
            error!("cannot open database: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };
    let package_index = match PackageIndex::open(&cfg.vec_db_path, cfg.vec_similarity_floor) {
        Ok(index) => Arc::new(index),
        Err(e) => {
            error!("cannot open package index: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    // Registries, hydrated from persisted rows.
    let persisted_workspaces = db
        .as_ref()
        .and_then(|db| db.load_workspaces().ok())
        .unwrap_or_default();
    let workspaces = Arc::new(WorkspaceRegistry::from_rows(persisted_workspaces));
    let persisted_endpoints = db
        .as_ref()
        .and_then(|db| db.load_endpoints().ok())
        .unwrap_or_default();
    let endpoints = Arc::new(EndpointRegistry::bootstrap(&cfg, persisted_endpoints));

    let default_ws = workspaces
        .get(DEFAULT_WORKSPACE)
        .expect("default workspace always present");
    let active_ws_id = db
        .as_ref()
        .and_then(|db| db.load_session().ok().flatten())
        .map(|(_, ws_id)| ws_id)
        .filter(|id| workspaces.get_by_id(id).is_some())
        .unwrap_or(default_ws.id);
    let sessions = Arc::new(SessionRegistry::new(active_ws_id));
    if let Some(db) = &db {
        if let Err(e) = db.save_session(&sessions.current()) {
            tracing::warn!("failed to persist session: {e}");
        }
    }

    let certificate_authority = match CertificateAuthority::load_or_create(&cfg) {
        Ok(ca) => ca,
        Err(e) => {
            error!("certificate authority: {e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    let stats = Stats::new();
    let state = Arc::new(GatewayState {
        client: reqwest::Client::new(),
        workspaces: workspaces.clone(),
        endpoints: endpoints.clone(),
        sessions: sessions.clone(),
        db: db.clone(),
        package_index,
        recognizer: Arc::new(RegexRecognizer),
        stats: stats.clone(),
    });
    let api_state = Arc::new(api::ApiState {
        workspaces,
        endpoints,
        sessions: sessions.clone(),
        db,
        stats,
    });

    let gateway_listener = match bind(&cfg.host, cfg.port).await {
        Ok(l) => l,
        Err(e) => {
            error!("{e}");
            std::process::exit(EXIT_STARTUP);
        }
    };
    let proxy_listener = match bind(&cfg.host, cfg.proxy_port).await {
        Ok(l) => l,
        Err(e) => {
            error!("{e}");
            std::process::exit(EXIT_STARTUP);
        }
    };
    let api_listener = match bind(&cfg.host, cfg.api_port).await {
        Ok(l) => l,
        Err(e) => {
            error!("{e}");
            std::process::exit(EXIT_STARTUP);
        }
    };

    info!("codegate v{}", env!("CARGO_PKG_VERSION"));
    info!("  provider proxy:   http://{}:{}", cfg.host, cfg.port);
    info!("  tls intercept:    {}:{}", cfg.host, cfg.proxy_port);
    info!("  dashboard api:    http://{}:{}/api/v1", cfg.host, cfg.api_port);
    info!("  ca certificate:   {}", cfg.ca_cert_path().display());

    let gateway = tokio::spawn(server::run(state.clone(), gateway_listener));
    let interceptor = tokio::spawn(intercept::run(
        state.clone(),
        certificate_authority,
        proxy_listener,
    ));
    let management = tokio::spawn(api::run(api_state, api_listener));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            // Grace period for in-flight streams; anything still running
            // after the deadline is aborted with the runtime.
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
        _ = gateway => error!("gateway listener exited"),
        _ = interceptor => error!("interceptor exited"),
        _ = management => error!("management API exited"),
    }

    // Wipe session substitution state before exit.
    state.sessions.shutdown();
}
