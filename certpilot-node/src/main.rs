use certpilot_core::{Clock, SystemClock};
use certpilot_node::config::{LogFormat, LogSection, NodeConfig, Overrides};
use certpilot_node::metrics::Metrics;
use certpilot_node::tls::listener::TlsValidationListener;
use certpilot_node::tls::{
    DirectoryCertificateStore, InstantAcmeAuthority, install_rustls_crypto_provider,
};
use certpilot_node::topology::{NodeRole, compose_follower, compose_master};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Certpilot Node - ACME certificate issuance and renewal
#[derive(Parser)]
#[command(name = "certpilot-node")]
#[command(version)]
#[command(about = "Certpilot Node - ACME certificate issuance and renewal")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "CERTPILOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node role; only a master talks to the ACME authority
    #[arg(long, value_enum, env = "CERTPILOT_ROLE")]
    pub role: Option<NodeRole>,

    /// Data directory for account credentials and the shared store
    #[arg(long, env = "CERTPILOT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// HTTP-01 listen address
    #[arg(long)]
    pub http_listen: Option<String>,

    /// TLS-ALPN-01 listen address
    #[arg(long)]
    pub tls_listen: Option<String>,

    /// Use Let's Encrypt staging environment
    #[arg(long)]
    pub acme_staging: bool,

    /// ACME contact email
    #[arg(long, env = "CERTPILOT_ACME_EMAIL")]
    pub acme_email: Option<String>,

    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Do not serve /metrics
    #[arg(long)]
    pub no_metrics: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            role: self.role,
            data_dir: self.data_dir.clone(),
            http_listen: self.http_listen.clone(),
            tls_listen: self.tls_listen.clone(),
            acme_staging: self.acme_staging,
            acme_email: self.acme_email.clone(),
            log_format: self.log_format,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load_from_file(path)?,
        None => NodeConfig::default(),
    };
    config.apply(args.overrides())?;

    let _log_guard = init_tracing(&config.log)?;
    install_rustls_crypto_provider();

    tracing::info!("Certpilot Node v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Role: {}", config.role);
    tracing::info!("Data directory: {}", config.data_dir().display());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config, !args.no_metrics))
}

/// Stderr logging, plus a daily-rolling file when `log.directory` is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log: &LogSection) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_writer, guard) = match &log.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::daily(directory, "certpilot-node.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match log.format {
        LogFormat::Text => {
            let file_layer = file_writer.map(|writer| {
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(writer)
            });
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(file_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let file_layer = file_writer.map(|writer| {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(writer)
            });
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_target(false))
                .with(file_layer)
                .try_init()?;
        }
    }
    Ok(guard)
}

async fn run(config: NodeConfig, metrics_enabled: bool) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = if metrics_enabled {
        Some(Arc::new(Metrics::new()?))
    } else {
        None
    };

    let store = Arc::new(DirectoryCertificateStore::new(config.store_path()));
    let node = match config.role {
        NodeRole::Master => {
            let acme = config.acme_config()?;
            if acme.is_staging() {
                tracing::warn!(
                    "Using Let's Encrypt STAGING environment - certificates will NOT be trusted!"
                );
            }
            let authority = Arc::new(InstantAcmeAuthority::new(acme));
            compose_master(&config, authority, store, clock, metrics)?.node
        }
        NodeRole::Follower => compose_follower(&config, store, clock, metrics),
    };

    // Responders come up before the first issuance so its challenges can be answered.
    let mut servers = JoinSet::new();
    let http = TcpListener::bind(config.http_addr()?).await?;
    servers.spawn(node.http_endpoint().serve(http, cancel.clone()));
    if let Some(addr) = config.tls_addr()? {
        let tls = TcpListener::bind(addr).await?;
        let listener = TlsValidationListener::new(node.cert_resolver(), node.http_endpoint())?;
        servers.spawn(listener.serve(tls, cancel.clone()));
    }

    tokio::spawn(shutdown_on_signal(cancel.clone()));

    node.startup(&cancel).await;
    let lifecycle = node.spawn_lifecycle(cancel.clone());

    cancel.cancelled().await;
    if let Err(e) = lifecycle.await {
        tracing::error!(error = %e, "Lifecycle task failed");
    }
    while servers.join_next().await.is_some() {}
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received, cancelling in-flight work");
    cancel.cancel();
}
