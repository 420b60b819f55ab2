use anyhow::Context;
use clap::Parser;
use frontdoor::{
    clients::{docker::DockerClient, openssl::OpensslCertTool, proxy_admin::{DefaultProxyAdminClient, ProxyAdminClient}},
    config::Config,
    events::EventBus,
    locks::LockManager,
    paths::{PathError, PathResolver},
    repositories::{agent::SqliteAgentRepository, sqlite::open_registry},
    resilience::breaker::{BreakerConfig, CircuitBreaker, spawn_health_probe},
    routes::{AppState, build_router},
    services::{
        certificates::{CertificateServiceArgs, DefaultCertificateService, certificate_rate_limits},
        lifecycle::{LifecycleConfig, ProxyLifecycle, ProxyLifecycleArgs},
        optimizer::LoadOptimizer,
        orchestrator::{Orchestrator, OrchestratorArgs, OrchestratorError},
        prober::MongoProber,
    },
    store::ConfigStore,
    workers::{cert_monitor::CertificateMonitor, optimizer::OptimizerWorker, proxy_watch::ProxyWatcher, renewal::RenewalWorker},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::signal::{self, unix::SignalKind};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::filter::EnvFilter;

const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_CONFIG_UNUSABLE: i32 = 2;
const EXIT_PROXY_UNREACHABLE: i32 = 3;

/// Front door control plane: programs the sibling reverse proxy so agents'
/// MongoDB instances and HTTP applications are reachable through stable
/// per-agent subdomains.
#[derive(Parser)]
struct Cli {
    /// The path to the config file.
    #[clap(short, long, env = "FRONTDOOR_CONFIG", default_value = "/etc/frontdoor/config.yaml")]
    config_path: PathBuf,
}

enum RunError {
    Init(anyhow::Error),
    ConfigUnusable(PathError),
    ProxyUnreachable(OrchestratorError),
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    let terminate = async {
        signal::unix::signal(SignalKind::terminate()).expect("failed to install signal handler").recv().await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}

async fn run(cli: Cli) -> Result<(), RunError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::load(&cli.config_path).map_err(RunError::Init)?;
    let paths = PathResolver::resolve(config.paths.base.clone()).map_err(RunError::ConfigUnusable)?;
    info!("Serving domains app={} mongo={}", config.domains.app, config.domains.mongo);

    PrometheusBuilder::new()
        .with_http_listener(config.metrics.bind_endpoint)
        .install()
        .context("Failed to install metrics exporter")
        .map_err(RunError::Init)?;

    let registry = open_registry(&config.db.url).await.map_err(RunError::Init)?;
    let agents = Arc::new(SqliteAgentRepository::new(registry));
    let locks = LockManager::new(paths.locks_dir());
    let store = ConfigStore::new(paths.clone(), locks.clone(), config.domains.mongo.clone());
    let events = EventBus::new();

    let certificate_breaker = Arc::new(
        CircuitBreaker::new("certificates", BreakerConfig { rate_limits: certificate_rate_limits(), ..Default::default() })
            .with_events(events.clone()),
    );
    let certificates = Arc::new(DefaultCertificateService::new(CertificateServiceArgs {
        paths: paths.clone(),
        locks: locks.clone(),
        tool: Arc::new(OpensslCertTool::new(config.certificates.openssl_bin.clone())),
        breaker: certificate_breaker.clone(),
        proxy_certs_dir: config.proxy.certs_dir.clone(),
    }));

    let admin = Arc::new(
        DefaultProxyAdminClient::new(config.proxy.admin_endpoint.clone())
            .context("Failed to build proxy admin client")
            .map_err(RunError::Init)?,
    );
    let proxy_breaker = Arc::new(CircuitBreaker::new("proxy", BreakerConfig::default()).with_events(events.clone()));
    let lifecycle = Arc::new(ProxyLifecycle::new(ProxyLifecycleArgs {
        admin: admin.clone(),
        runtime: Arc::new(DockerClient::new(config.proxy.docker_bin.clone())),
        breaker: proxy_breaker.clone(),
        events: events.clone(),
        config: LifecycleConfig {
            container_name: config.proxy.container_name.clone(),
            process_name: config.proxy.process_name.clone(),
            service_restart_command: config.proxy.service_restart_command.clone(),
            max_attempts: config.proxy.recovery.max_attempts,
            backoff_base: config.proxy.recovery.backoff_base,
            backoff_cap: config.proxy.recovery.backoff_cap,
            grace_period: config.proxy.recovery.grace_period,
        },
    }));

    let prober = Arc::new(MongoProber::new().context("Failed to build prober").map_err(RunError::Init)?);
    let orchestrator = Arc::new(Orchestrator::new(OrchestratorArgs {
        store,
        agents: agents.clone(),
        certificates: certificates.clone(),
        prober,
        lifecycle: lifecycle.clone(),
        locks,
        events: events.clone(),
        domains: config.domains.clone(),
    }));

    info!("Running startup reconciliation");
    orchestrator.startup_reconcile().await.map_err(|e| match e {
        OrchestratorError::Recovery(_) => RunError::ProxyUnreachable(e),
        e => RunError::Init(e.into()),
    })?;

    CertificateMonitor::new(certificates, events.clone(), config.certificates.warning_days)
        .spawn(config.monitor.interval);
    RenewalWorker::spawn(orchestrator.clone(), config.certificates.renew_check_interval, config.certificates.renew_before_days);
    OptimizerWorker::spawn(
        Arc::new(LoadOptimizer::new(admin.clone(), events.clone(), config.optimizer.clone())),
        config.optimizer.interval,
    );
    ProxyWatcher::spawn(lifecycle.clone(), config.proxy.health_check_interval);
    {
        let admin = admin.clone();
        spawn_health_probe(proxy_breaker.clone(), config.proxy.health_check_interval, move || {
            let admin = admin.clone();
            async move { admin.check_health().await.is_ok() }
        });
    }

    let state = AppState {
        orchestrator,
        lifecycle,
        agents,
        breakers: vec![certificate_breaker, proxy_breaker],
        domains: config.domains.clone(),
        started_at: std::time::Instant::now(),
    };
    let router = build_router(state, config.api.token.clone());

    info!("Binding API on {}", config.api.bind_endpoint);
    let server = axum_server::bind(config.api.bind_endpoint)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());
    tokio::select! {
        result = server => {
            result.context("API server failed").map_err(RunError::Init)?;
        }
        _ = shutdown_signal() => {
            info!("Shutting down");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(RunError::ConfigUnusable(e)) => {
            error!("No usable filesystem layout: {e}");
            std::process::exit(EXIT_CONFIG_UNUSABLE);
        }
        Err(RunError::ProxyUnreachable(e)) => {
            error!("Proxy unreachable after escalation: {e}");
            std::process::exit(EXIT_PROXY_UNREACHABLE);
        }
        Err(RunError::Init(e)) => {
            error!("Initialization failed: {e:#}");
            std::process::exit(EXIT_INIT_FAILURE);
        }
    }
}
