use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use hotswap_registry::coordination::{CoordinationClient, MemoryCoordinator};
use hotswap_registry::core::{ConfigStore, ServiceConfig};
use hotswap_registry::registry::RegistryOptions;
use hotswap_registry::server::{BoundServer, ListenAddr, ServerOptions};
use hotswap_registry::telemetry::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tonic::service::RoutesBuilder;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process store; discovery is only visible to this process.
    Memory,
    /// etcd cluster at `coordination.addr` (comma-separated endpoints).
    Etcd,
}

/// Serve a gRPC endpoint that stays registered across address changes.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hotswap-server",
    version,
    about = "gRPC server with lease-backed registration and live rebinding"
)]
struct CliArgs {
    /// Name the endpoint is advertised under: `service/<name>/<addr>`.
    ///
    /// Environment variable: `SERVICE_NAME`
    #[arg(long, env = "SERVICE_NAME", default_value_t = String::from("task"))]
    service_name: String,

    /// Deployment environment; selects `<config-dir>/<app-env>/config.yaml`.
    ///
    /// Environment variable: `APP_ENV`
    #[arg(long, env = "APP_ENV", default_value_t = String::from("test"))]
    app_env: String,

    /// Directory holding one sub-directory per environment.
    ///
    /// Environment variable: `CONFIG_DIR`
    #[arg(long, env = "CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Explicit configuration file; overrides `--config-dir`/`--app-env`.
    ///
    /// Environment variable: `CONFIG_FILE`
    #[arg(long, env = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Prefix of environment overrides, e.g. `APP__SERVER__ADDR`.
    ///
    /// Environment variable: `ENV_PREFIX`
    #[arg(long, env = "ENV_PREFIX", default_value_t = String::from("APP"))]
    env_prefix: String,

    /// Coordination store backend.
    ///
    /// Environment variable: `COORDINATION_BACKEND`
    #[arg(long, env = "COORDINATION_BACKEND", value_enum, default_value_t = Backend::Memory)]
    coordination: Backend,

    /// Lease TTL in seconds.
    ///
    /// Environment variable: `LEASE_TTL_SECS`
    #[arg(long, env = "LEASE_TTL_SECS", default_value_t = 15)]
    lease_ttl_secs: u64,

    /// Upper bound on each coordination call, in milliseconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 1000)]
    request_timeout_ms: u64,

    /// Quiet period before a changed config file is reloaded, in milliseconds.
    ///
    /// Environment variable: `WATCH_DEBOUNCE_MS`
    #[arg(long, env = "WATCH_DEBOUNCE_MS", default_value_t = 200)]
    watch_debounce_ms: u64,

    /// Emit logs as JSON lines.
    ///
    /// Environment variable: `LOG_JSON`
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    json_logs: bool,
}

impl CliArgs {
    fn config_path(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| self.config_dir.join(&self.app_env).join("config.yaml"))
    }

    fn server_options(&self) -> anyhow::Result<ServerOptions> {
        if self.lease_ttl_secs == 0 {
            bail!("LEASE_TTL_SECS must be greater than 0");
        }
        if self.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be greater than 0");
        }
        Ok(ServerOptions {
            service_name: self.service_name.clone(),
            registry: RegistryOptions {
                lease_ttl: Duration::from_secs(self.lease_ttl_secs),
                request_timeout: Duration::from_millis(self.request_timeout_ms),
            },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Startup flags may come from .env; config overrides in it are re-read on change.
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    init_tracing(args.json_logs)?;

    let options = args.server_options()?;
    let path = args.config_path();
    let store: ConfigStore<ServiceConfig> = ConfigStore::builder()
        .with_file(&path)
        .with_env_overrides(&args.env_prefix, "__")
        .with_dotenv(".env", &args.env_prefix, "__")
        .with_file_watch(Duration::from_millis(args.watch_debounce_ms))
        .build()
        .with_context(|| format!("loading {}", path.display()))?;

    let snapshot = store.current();
    tracing::info!(
        config = %path.display(),
        service = %options.service_name,
        addr = %snapshot.server.addr,
        coordination = %snapshot.coordination.addr,
        "starting"
    );

    let client = connect(args.coordination, &snapshot.coordination.addr).await?;

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    let registrar = move |routes: &mut RoutesBuilder| {
        routes.add_service(health_service.clone());
    };

    let server = BoundServer::new(
        ListenAddr::parse(&snapshot.server.addr)?,
        client,
        registrar,
        options,
    );
    store.add_observer(Arc::new(server.clone()));

    tokio::spawn(shutdown_signal(server.clone(), health_reporter));
    server.serve().await?;
    Ok(())
}

async fn connect(backend: Backend, addr: &str) -> anyhow::Result<Arc<dyn CoordinationClient>> {
    match backend {
        Backend::Memory => {
            tracing::warn!("using the in-memory coordination store; other processes cannot discover this endpoint");
            Ok(Arc::new(MemoryCoordinator::new().client()))
        }
        #[cfg(feature = "etcd")]
        Backend::Etcd => {
            use hotswap_registry::coordination::EtcdCoordinator;
            let endpoints: Vec<String> = addr
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            let client = EtcdCoordinator::connect(&endpoints, Duration::from_secs(5)).await?;
            Ok(Arc::new(client))
        }
        #[cfg(not(feature = "etcd"))]
        Backend::Etcd => {
            bail!("etcd backend requested for {addr} but the `etcd` feature is not enabled")
        }
    }
}

async fn shutdown_signal(server: BoundServer, health_reporter: HealthReporter) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    // 1. Publish the status
    health_reporter
        .set_service_status("", ServingStatus::NotServing)
        .await;

    // 2. Withdraw, drain and disconnect
    if let Err(e) = server.shut_down().await {
        tracing::error!(error = %e, "error during shutdown");
    }
}
