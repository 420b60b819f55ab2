use crate::{
    config::DomainsConfig,
    events::{EventBus, SystemEvent},
    locks::{LockError, LockManager},
    repositories::agent::{AgentRecord, AgentRepository, AgentRepositoryError, TlsPreference},
    services::{
        certificates::{CertificateError, CertificateService, RenewScanOptions, RenewScanReport},
        lifecycle::{ProxyHealth, ProxyLifecycle, RecoveryError},
        prober::{ConnectionProber, TlsPosture},
    },
    store::{
        ConfigStore, StoreError,
        document::{DynamicDocument, MONGODB_PORT, RouteFragment, mongodb_router_name},
    },
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("agent '{0}' is not registered")]
    UnknownAgent(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("agent registry: {0}")]
    Repository(AgentRepositoryError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl From<AgentRepositoryError> for OrchestratorError {
    fn from(e: AgentRepositoryError) -> Self {
        Self::Repository(e)
    }
}

#[derive(Clone, Debug)]
pub struct RegisterOutcome {
    pub mongodb_url: String,
    pub tls_posture: TlsPosture,
    pub certificate_issued: bool,
}

#[derive(Clone, Debug)]
pub struct SubdomainOutcome {
    pub domain: String,
    pub mongodb_url: String,
    pub tls_passthrough: bool,
}

#[derive(Clone, Debug)]
pub struct AppOutcome {
    pub domain: String,
    pub target_url: String,
}

#[derive(Clone, Debug)]
pub struct RemoveOutcome {
    pub route_removed: bool,
    pub certificate_revoked: bool,
}

#[derive(Clone, Debug)]
pub struct ConnectionTest {
    pub agent_id: String,
    pub target: String,
    pub posture: TlsPosture,
    pub tls_passthrough: bool,
    pub recommendations: Vec<String>,
}

pub struct OrchestratorArgs {
    pub store: ConfigStore,
    pub agents: Arc<dyn AgentRepository>,
    pub certificates: Arc<dyn CertificateService>,
    pub prober: Arc<dyn ConnectionProber>,
    pub lifecycle: Arc<ProxyLifecycle>,
    pub locks: LockManager,
    pub events: EventBus,
    pub domains: DomainsConfig,
}

/// Owns the write path for routes and certificates: per-agent advisory locks
/// order mutations per agent, one writer gate serializes rewrites of the
/// merged document, and the proxy is asked to reload after every change.
pub struct Orchestrator {
    store: ConfigStore,
    agents: Arc<dyn AgentRepository>,
    certificates: Arc<dyn CertificateService>,
    prober: Arc<dyn ConnectionProber>,
    lifecycle: Arc<ProxyLifecycle>,
    locks: LockManager,
    events: EventBus,
    domains: DomainsConfig,
    write_gate: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(args: OrchestratorArgs) -> Self {
        let OrchestratorArgs { store, agents, certificates, prober, lifecycle, locks, events, domains } = args;
        Self {
            store,
            agents,
            certificates,
            prober,
            lifecycle,
            locks,
            events,
            domains,
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Register an agent: classify its TLS posture, issue a certificate when
    /// needed, write the L4 route, rewrite the merged document, reload.
    pub async fn register_agent(&self, agent_id: &str, target_ip: &str) -> Result<RegisterOutcome, OrchestratorError> {
        let guard = self.locks.acquire(&format!("agent:{agent_id}"), LOCK_TIMEOUT).await?;
        let result = self.register_locked(agent_id, target_ip).await;
        guard.release().await;
        result
    }

    async fn register_locked(&self, agent_id: &str, target_ip: &str) -> Result<RegisterOutcome, OrchestratorError> {
        let posture = self.prober.classify(target_ip.to_string(), MONGODB_PORT).await;
        info!("Agent '{agent_id}' backend {target_ip}:{MONGODB_PORT} classified as {posture}");

        let validation = self.certificates.validate(agent_id.to_string()).await?;
        let certificate_issued = if validation.valid() {
            false
        } else {
            self.certificates.issue_agent(agent_id.to_string(), target_ip.to_string()).await?;
            true
        };

        self.write_route(agent_id, |fragment| {
            fragment.with_mongodb_route(agent_id, &self.domains.mongo, target_ip, MONGODB_PORT, posture.wants_passthrough())
        })
        .await?;

        self.upsert_agent(agent_id, target_ip, posture).await?;
        let domain = format!("{agent_id}.{}", self.domains.mongo);
        self.events.emit(SystemEvent::RouteAdded { agent_id: agent_id.to_string(), domain: domain.clone() });
        Ok(RegisterOutcome {
            mongodb_url: format!("mongodb://{domain}:{MONGODB_PORT}"),
            tls_posture: posture,
            certificate_issued,
        })
    }

    /// Add (or repoint) a MongoDB route without touching certificates.
    pub async fn add_mongodb_subdomain(
        &self,
        subdomain: &str,
        target_ip: &str,
        agent_id: Option<&str>,
    ) -> Result<SubdomainOutcome, OrchestratorError> {
        let agent_id = agent_id.unwrap_or(subdomain);
        let guard = self.locks.acquire(&format!("agent:{agent_id}"), LOCK_TIMEOUT).await?;
        let result = async {
            let posture = self.prober.classify(target_ip.to_string(), MONGODB_PORT).await;
            let passthrough = posture.wants_passthrough();
            self.write_route(agent_id, |fragment| {
                fragment.with_mongodb_route(agent_id, &self.domains.mongo, target_ip, MONGODB_PORT, passthrough)
            })
            .await?;
            self.upsert_agent(agent_id, target_ip, posture).await?;
            let domain = format!("{agent_id}.{}", self.domains.mongo);
            self.events.emit(SystemEvent::RouteAdded { agent_id: agent_id.to_string(), domain: domain.clone() });
            Ok(SubdomainOutcome {
                mongodb_url: format!("mongodb://{domain}:{MONGODB_PORT}"),
                domain,
                tls_passthrough: passthrough,
            })
        }
        .await;
        guard.release().await;
        result
    }

    /// Add an HTTP application route under the app domain.
    pub async fn add_app_route(
        &self,
        subdomain: &str,
        target_url: &str,
        agent_id: Option<&str>,
    ) -> Result<AppOutcome, OrchestratorError> {
        let agent_id = agent_id.unwrap_or(subdomain);
        let guard = self.locks.acquire(&format!("agent:{agent_id}"), LOCK_TIMEOUT).await?;
        let result = async {
            self.write_route(agent_id, |fragment| {
                fragment.with_app_route(agent_id, subdomain, &self.domains.app, target_url)
            })
            .await?;
            let domain = format!("{subdomain}.{}", self.domains.app);
            self.events.emit(SystemEvent::RouteAdded { agent_id: agent_id.to_string(), domain: domain.clone() });
            Ok(AppOutcome { domain, target_url: target_url.to_string() })
        }
        .await;
        guard.release().await;
        result
    }

    /// Remove an agent: revoke its certificate, drop its fragment, rewrite
    /// the merged document, reload. Idempotent.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<RemoveOutcome, OrchestratorError> {
        let guard = self.locks.acquire(&format!("agent:{agent_id}"), LOCK_TIMEOUT).await?;
        let result = async {
            let certificate_revoked = self.certificates.revoke(agent_id.to_string()).await?;
            let route_removed = {
                let _writer = self.write_gate.lock().await;
                self.store.delete_fragment(agent_id).await?
            };
            self.reload_proxy().await;
            self.agents.delete(agent_id.to_string()).await?;
            self.events.emit(SystemEvent::RouteRemoved { agent_id: agent_id.to_string() });
            Ok(RemoveOutcome { route_removed, certificate_revoked })
        }
        .await;
        guard.release().await;
        result
    }

    /// Probe an agent's backend and compare against the routed posture.
    pub async fn test_agent(&self, agent_id: &str) -> Result<ConnectionTest, OrchestratorError> {
        let agent = match self.agents.find(agent_id.to_string()).await {
            Ok(agent) => agent,
            Err(AgentRepositoryError::AgentNotFound) => {
                return Err(OrchestratorError::UnknownAgent(agent_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let posture = self.prober.classify(agent.target_ip.clone(), agent.target_port).await;
        let tls_passthrough = match self.store.load_fragment(agent_id).await? {
            Some(fragment) => fragment
                .tcp
                .routers
                .get(&mongodb_router_name(agent_id))
                .and_then(|router| router.tls.as_ref())
                .is_some_and(|tls| tls.passthrough),
            None => false,
        };
        let recommendations = recommendations_for(posture, tls_passthrough);
        Ok(ConnectionTest {
            agent_id: agent_id.to_string(),
            target: format!("{}:{}", agent.target_ip, agent.target_port),
            posture,
            tls_passthrough,
            recommendations,
        })
    }

    /// Run the renewal scan; sync and reload when anything was renewed.
    pub async fn renew_certificates(&self, options: RenewScanOptions) -> Result<RenewScanReport, OrchestratorError> {
        let report = self.certificates.renew_scan(options).await?;
        if report.renewed > 0 {
            self.certificates.sync_to_proxy().await?;
            self.reload_proxy().await;
        }
        Ok(report)
    }

    /// The merged dynamic document, repairing corruption on the way.
    pub async fn merged_document(&self) -> Result<DynamicDocument, OrchestratorError> {
        Ok(self.store.load_dynamic_document().await?)
    }

    /// Boot-time reconciliation: CA, document repair, certificate sync, and
    /// one escalation ladder if the proxy is down.
    pub async fn startup_reconcile(&self) -> Result<(), OrchestratorError> {
        self.certificates.bootstrap_ca().await?;
        let document = self.store.load_dynamic_document().await?;
        info!("Dynamic document ready with {} tcp router(s)", document.tcp.routers.len());
        self.certificates.sync_to_proxy().await?;

        if self.lifecycle.probe_health().await != ProxyHealth::Healthy {
            warn!("Proxy unhealthy at startup, escalating");
            self.lifecycle.recover("startup probe failed").await?;
        }
        Ok(())
    }

    /// Apply a fragment mutation and rewrite the merged document under the
    /// single writer gate, then ask the proxy to reload. A failed reload is
    /// reported but never rolls the document back.
    async fn write_route<F>(&self, agent_id: &str, mutate: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce(RouteFragment) -> RouteFragment,
    {
        let fragment = self.store.load_fragment(agent_id).await?.unwrap_or_default();
        let fragment = mutate(fragment);
        {
            let _writer = self.write_gate.lock().await;
            self.store.save_fragment(agent_id, &fragment).await?;
        }
        self.reload_proxy().await;
        Ok(())
    }

    async fn reload_proxy(&self) {
        if let Err(e) = self.lifecycle.reload().await {
            warn!("Proxy reload failed, keeping new document as steady state: {e}");
        }
    }

    async fn upsert_agent(&self, agent_id: &str, target_ip: &str, posture: TlsPosture) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let created_at = match self.agents.find(agent_id.to_string()).await {
            Ok(existing) => existing.created_at,
            Err(AgentRepositoryError::AgentNotFound) => now,
            Err(e) => return Err(e.into()),
        };
        self.agents
            .upsert(AgentRecord {
                id: agent_id.to_string(),
                target_ip: target_ip.to_string(),
                target_port: MONGODB_PORT,
                tls_posture: TlsPreference::from(posture),
                created_at,
                updated_at: now,
            })
            .await?;
        Ok(())
    }
}

fn recommendations_for(posture: TlsPosture, tls_passthrough: bool) -> Vec<String> {
    let mut recommendations = Vec::new();
    match posture {
        TlsPosture::Unreachable => {
            recommendations.push(format!("backend did not accept a TCP connection on port {MONGODB_PORT}; verify the agent is online and the port is open"));
        }
        TlsPosture::Plaintext if tls_passthrough => {
            recommendations.push("backend answers plaintext but the route passes TLS through; re-register the agent to rewrite the route".into());
        }
        TlsPosture::TlsRequired if !tls_passthrough => {
            recommendations.push("backend requires TLS but the route terminates it; re-register the agent to enable passthrough".into());
        }
        TlsPosture::Ambiguous => {
            recommendations.push("handshake inconclusive; TLS passthrough is kept on as the safer default".into());
        }
        _ => {}
    }
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::{docker::MockContainerRuntime, proxy_admin::MockProxyAdminClient},
        paths::PathResolver,
        repositories::agent::MockAgentRepository,
        resilience::breaker::{BreakerConfig, CircuitBreaker},
        services::{
            certificates::{CertificateValidation, MockCertificateService},
            lifecycle::{LifecycleConfig, ProxyLifecycleArgs},
            prober::MockConnectionProber,
        },
    };
    use tempfile::TempDir;

    struct OrchestratorBuilder {
        dir: TempDir,
        agents: MockAgentRepository,
        certificates: MockCertificateService,
        prober: MockConnectionProber,
        admin: MockProxyAdminClient,
        runtime: MockContainerRuntime,
    }

    impl Default for OrchestratorBuilder {
        fn default() -> Self {
            Self {
                dir: TempDir::new().expect("failed to create temp dir"),
                agents: Default::default(),
                certificates: Default::default(),
                prober: Default::default(),
                admin: Default::default(),
                runtime: Default::default(),
            }
        }
    }

    struct OrchestratorCtx {
        orchestrator: Orchestrator,
        store: ConfigStore,
        events: EventBus,
        #[allow(dead_code)]
        dir: TempDir,
    }

    impl OrchestratorBuilder {
        fn build(self) -> OrchestratorCtx {
            let Self { dir, agents, certificates, prober, admin, runtime } = self;
            let paths = PathResolver::rooted_at(dir.path()).expect("failed to resolve paths");
            let locks = LockManager::new(paths.locks_dir());
            let store = ConfigStore::new(paths, locks.clone(), "mongodb.example.com");
            let events = EventBus::new();
            let lifecycle = Arc::new(ProxyLifecycle::new(ProxyLifecycleArgs {
                admin: Arc::new(admin),
                runtime: Arc::new(runtime),
                breaker: Arc::new(CircuitBreaker::new("proxy", BreakerConfig::default())),
                events: events.clone(),
                config: LifecycleConfig::default(),
            }));
            let orchestrator = Orchestrator::new(OrchestratorArgs {
                store: store.clone(),
                agents: Arc::new(agents),
                certificates: Arc::new(certificates),
                prober: Arc::new(prober),
                lifecycle,
                locks,
                events: events.clone(),
                domains: DomainsConfig { app: "apps.example.com".into(), mongo: "mongodb.example.com".into() },
            });
            OrchestratorCtx { orchestrator, store, events, dir }
        }
    }

    fn valid_cert(agent_id: &str) -> CertificateValidation {
        CertificateValidation { agent_id: agent_id.into(), issues: Vec::new() }
    }

    fn invalid_cert(agent_id: &str) -> CertificateValidation {
        CertificateValidation { agent_id: agent_id.into(), issues: vec!["private key missing".into()] }
    }

    #[tokio::test]
    async fn register_tls_backend_writes_passthrough_route() {
        let mut builder = OrchestratorBuilder::default();
        builder.prober.expect_classify().returning(|_, _| TlsPosture::TlsRequired);
        builder.certificates.expect_validate().returning(|id| Ok(invalid_cert(&id)));
        builder.certificates.expect_issue_agent().times(1).returning(|_, _| Ok(()));
        builder.admin.expect_signal_reload().times(1).returning(|| Ok(()));
        builder.agents.expect_find().returning(|_| Err(AgentRepositoryError::AgentNotFound));
        builder.agents.expect_upsert().times(1).returning(|record| {
            assert_eq!(record.id, "alpha-01");
            assert_eq!(record.tls_posture, TlsPreference::Required);
            Ok(())
        });
        let ctx = builder.build();
        let mut receiver = ctx.events.subscribe();

        let outcome = ctx.orchestrator.register_agent("alpha-01", "10.0.0.7").await.expect("register failed");
        assert_eq!(outcome.mongodb_url, "mongodb://alpha-01.mongodb.example.com:27017");
        assert!(outcome.certificate_issued);

        let document = ctx.store.load_dynamic_document().await.expect("failed to load document");
        let router = document.tcp.routers.get("alpha-01-mongodb").expect("route missing");
        assert_eq!(router.rule, "HostSNI(`alpha-01.mongodb.example.com`)");
        assert!(router.tls.as_ref().is_some_and(|tls| tls.passthrough));
        assert!(document.has_catchall());

        let event = receiver.recv().await.expect("no event");
        assert!(matches!(event, SystemEvent::RouteAdded { ref agent_id, .. } if agent_id == "alpha-01"));
    }

    #[tokio::test]
    async fn register_plaintext_backend_terminates_tls() {
        let mut builder = OrchestratorBuilder::default();
        builder.prober.expect_classify().returning(|_, _| TlsPosture::Plaintext);
        builder.certificates.expect_validate().returning(|id| Ok(valid_cert(&id)));
        builder.admin.expect_signal_reload().returning(|| Ok(()));
        builder.agents.expect_find().returning(|_| Err(AgentRepositoryError::AgentNotFound));
        builder.agents.expect_upsert().returning(|record| {
            assert_eq!(record.tls_posture, TlsPreference::Forbidden);
            Ok(())
        });
        let ctx = builder.build();

        let outcome = ctx.orchestrator.register_agent("beta", "10.0.0.8").await.expect("register failed");
        assert!(!outcome.certificate_issued);
        assert_eq!(outcome.tls_posture, TlsPosture::Plaintext);

        let document = ctx.store.load_dynamic_document().await.expect("failed to load document");
        let router = document.tcp.routers.get("beta-mongodb").expect("route missing");
        assert!(router.tls.is_none());
    }

    #[tokio::test]
    async fn failed_reload_does_not_roll_back() {
        let mut builder = OrchestratorBuilder::default();
        builder.prober.expect_classify().returning(|_, _| TlsPosture::TlsRequired);
        builder.certificates.expect_validate().returning(|id| Ok(valid_cert(&id)));
        builder
            .admin
            .expect_signal_reload()
            .returning(|| Err(crate::clients::proxy_admin::ProxyAdminError::Decode(serde_json::from_str::<u32>("x").unwrap_err())));
        builder.agents.expect_find().returning(|_| Err(AgentRepositoryError::AgentNotFound));
        builder.agents.expect_upsert().returning(|_| Ok(()));
        let ctx = builder.build();

        ctx.orchestrator.register_agent("gamma", "10.0.0.9").await.expect("register failed");
        let document = ctx.store.load_dynamic_document().await.expect("failed to load document");
        assert!(document.tcp.routers.contains_key("gamma-mongodb"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_serialize() {
        let mut builder = OrchestratorBuilder::default();
        builder.prober.expect_classify().returning(|_, _| TlsPosture::TlsRequired);
        builder.certificates.expect_validate().returning(|id| Ok(valid_cert(&id)));
        builder.admin.expect_signal_reload().returning(|| Ok(()));
        builder.agents.expect_find().returning(|_| Err(AgentRepositoryError::AgentNotFound));
        builder.agents.expect_upsert().returning(|_| Ok(()));
        let ctx = builder.build();
        let orchestrator = Arc::new(ctx.orchestrator);

        let first = orchestrator.clone();
        let second = orchestrator.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.register_agent("delta", "10.0.0.8").await }),
            tokio::spawn(async move { second.register_agent("delta", "10.0.0.8").await }),
        );
        let a = a.expect("join failed").expect("first registration failed");
        let b = b.expect("join failed").expect("second registration failed");
        assert_eq!(a.mongodb_url, b.mongodb_url);

        let document = ctx.store.load_dynamic_document().await.expect("failed to load document");
        let routers: Vec<_> = document.tcp.routers.keys().filter(|name| name.starts_with("delta")).collect();
        assert_eq!(routers.len(), 1, "duplicate routers: {routers:?}");
    }

    #[tokio::test]
    async fn remove_agent_is_symmetric() {
        let mut builder = OrchestratorBuilder::default();
        builder.prober.expect_classify().returning(|_, _| TlsPosture::TlsRequired);
        builder.certificates.expect_validate().returning(|id| Ok(valid_cert(&id)));
        builder.certificates.expect_revoke().times(1).returning(|_| Ok(true));
        builder.admin.expect_signal_reload().returning(|| Ok(()));
        builder.agents.expect_find().returning(|_| Err(AgentRepositoryError::AgentNotFound));
        builder.agents.expect_upsert().returning(|_| Ok(()));
        builder.agents.expect_delete().times(1).returning(|_| Ok(true));
        let ctx = builder.build();

        ctx.orchestrator.register_agent("epsilon", "10.0.0.7").await.expect("register failed");
        let outcome = ctx.orchestrator.remove_agent("epsilon").await.expect("remove failed");
        assert!(outcome.route_removed);
        assert!(outcome.certificate_revoked);

        let document = ctx.store.load_dynamic_document().await.expect("failed to load document");
        assert!(!document.tcp.routers.contains_key("epsilon-mongodb"));
        assert!(document.has_catchall());
    }

    #[tokio::test]
    async fn app_route_lands_in_http_section() {
        let mut builder = OrchestratorBuilder::default();
        builder.admin.expect_signal_reload().returning(|| Ok(()));
        let ctx = builder.build();

        let outcome = ctx
            .orchestrator
            .add_app_route("shop", "http://10.0.0.9:3000", Some("epsilon"))
            .await
            .expect("add app failed");
        assert_eq!(outcome.domain, "shop.apps.example.com");

        let document = ctx.store.load_dynamic_document().await.expect("failed to load document");
        let router = document.http.routers.get("epsilon-app-shop").expect("route missing");
        assert_eq!(router.rule, "Host(`shop.apps.example.com`)");
        document.validate().expect("merged document invalid");
    }

    #[tokio::test]
    async fn test_agent_requires_registration() {
        let mut builder = OrchestratorBuilder::default();
        builder.agents.expect_find().returning(|_| Err(AgentRepositoryError::AgentNotFound));
        let ctx = builder.build();

        let err = ctx.orchestrator.test_agent("ghost").await.expect_err("test succeeded");
        assert!(matches!(err, OrchestratorError::UnknownAgent(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_agent_flags_posture_mismatch() {
        let mut builder = OrchestratorBuilder::default();
        builder.prober.expect_classify().returning(|_, _| TlsPosture::TlsRequired);
        builder.certificates.expect_validate().returning(|id| Ok(valid_cert(&id)));
        builder.admin.expect_signal_reload().returning(|| Ok(()));
        builder.agents.expect_upsert().returning(|_| Ok(()));
        let now = Utc::now();
        let mut first = true;
        builder.agents.expect_find().returning(move |id| {
            // Not found during registration, found afterwards.
            if first {
                first = false;
                return Err(AgentRepositoryError::AgentNotFound);
            }
            Ok(AgentRecord {
                id,
                target_ip: "10.0.0.7".into(),
                target_port: 27017,
                tls_posture: TlsPreference::Required,
                created_at: now,
                updated_at: now,
            })
        });
        let ctx = builder.build();
        ctx.orchestrator.register_agent("zeta", "10.0.0.7").await.expect("register failed");

        // Backend now answers plaintext while the route still passes TLS through.
        let mut builder_probe = MockConnectionProber::new();
        builder_probe.expect_classify().returning(|_, _| TlsPosture::Plaintext);
        let orchestrator = Orchestrator { prober: Arc::new(builder_probe), ..ctx.orchestrator };

        let test = orchestrator.test_agent("zeta").await.expect("test failed");
        assert!(test.tls_passthrough);
        assert_eq!(test.posture, TlsPosture::Plaintext);
        assert_eq!(test.recommendations.len(), 1);
    }

    #[tokio::test]
    async fn renewals_trigger_sync_and_reload() {
        let mut builder = OrchestratorBuilder::default();
        builder.certificates.expect_renew_scan().returning(|_| {
            Ok(RenewScanReport { checked: 2, renewed: 1, skipped: 1, ..Default::default() })
        });
        builder.certificates.expect_sync_to_proxy().times(1).returning(|| Ok(()));
        builder.admin.expect_signal_reload().times(1).returning(|| Ok(()));
        let ctx = builder.build();

        let report = ctx.orchestrator.renew_certificates(RenewScanOptions::default()).await.expect("renew failed");
        assert_eq!(report.renewed, 1);
    }

    #[tokio::test]
    async fn no_renewals_no_reload() {
        let mut builder = OrchestratorBuilder::default();
        builder.certificates.expect_renew_scan().returning(|_| Ok(RenewScanReport::default()));
        builder.certificates.expect_sync_to_proxy().never();
        builder.admin.expect_signal_reload().never();
        let ctx = builder.build();

        ctx.orchestrator.renew_certificates(RenewScanOptions::default()).await.expect("renew failed");
    }
}
