use crate::{
    clients::{docker::ContainerRuntime, proxy_admin::{ProxyAdminClient, ProxyAdminError}},
    events::{EventBus, SystemEvent},
    resilience::breaker::CircuitBreaker,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing::{error, info, warn};

const HISTORY_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ProxyHealth {
    Healthy,
    Unhealthy,
    ContainerDown,
    ServiceDown,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RecoveryAction {
    ContainerStart,
    ServiceRestart,
    ContainerRestart,
}

#[derive(Clone, Debug)]
pub struct RecoveryRecord {
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub action: RecoveryAction,
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Copy, Debug)]
pub struct HealthSnapshot {
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// The sibling container running the proxy engine.
    pub container_name: String,

    /// The proxy process name, used for the in-container liveness fallback.
    pub process_name: String,

    /// Command run inside the container when the admin reload fails.
    pub service_restart_command: Vec<String>,

    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,

    /// How long to wait after a recovery rung before re-probing.
    pub grace_period: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            container_name: "frontdoor-proxy".into(),
            process_name: "traefik".into(),
            service_restart_command: vec!["sh".into(), "-c".into(), "kill -HUP 1".into()],
            max_attempts: 5,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(300),
            grace_period: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("maximum recovery attempts ({attempts}) reached, operator action required")]
    MaxAttemptsReached { attempts: u32 },

    #[error("automatic recovery is disabled pending operator action")]
    Disabled,
}

#[derive(Debug, thiserror::Error)]
#[error("proxy reload failed: {0}")]
pub struct ReloadError(#[from] pub ProxyAdminError);

struct HealthState {
    health: ProxyHealth,
    consecutive_failures: u32,
    last_transition: DateTime<Utc>,
}

/// Watches the sibling proxy and brings it back when it fails: health probe,
/// breaker feeding, and the graduated recovery escalator
/// (start -> reload/service restart -> container restart).
pub struct ProxyLifecycle {
    admin: Arc<dyn ProxyAdminClient>,
    runtime: Arc<dyn ContainerRuntime>,
    breaker: Arc<CircuitBreaker>,
    events: EventBus,
    config: LifecycleConfig,
    state: Mutex<HealthState>,
    history: Mutex<VecDeque<RecoveryRecord>>,
    auto_recovery: AtomicBool,

    /// Held for the duration of one recovery sequence; concurrent triggers
    /// coalesce by failing to take it.
    recovering: tokio::sync::Mutex<()>,
}

pub struct ProxyLifecycleArgs {
    pub admin: Arc<dyn ProxyAdminClient>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub breaker: Arc<CircuitBreaker>,
    pub events: EventBus,
    pub config: LifecycleConfig,
}

impl ProxyLifecycle {
    pub fn new(args: ProxyLifecycleArgs) -> Self {
        let ProxyLifecycleArgs { admin, runtime, breaker, events, config } = args;
        let state = HealthState { health: ProxyHealth::Unknown, consecutive_failures: 0, last_transition: Utc::now() };
        Self {
            admin,
            runtime,
            breaker,
            events,
            config,
            state: Mutex::new(state),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            auto_recovery: AtomicBool::new(true),
            recovering: tokio::sync::Mutex::new(()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Probe the proxy and classify: admin endpoint, then container state,
    /// then in-container process presence. Feeds the lifecycle breaker.
    pub async fn probe_health(&self) -> ProxyHealth {
        let health = self.classify().await;
        let healthy = health == ProxyHealth::Healthy;
        {
            let mut state = self.state.lock().expect("health state poisoned");
            if state.health != health {
                info!("Proxy health transition {} -> {health}", state.health);
                state.last_transition = Utc::now();
            }
            state.health = health;
            if healthy {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
                let failures = state.consecutive_failures;
                drop(state);
                self.events.emit(SystemEvent::ProxyUnhealthy { health: health.to_string(), consecutive_failures: failures });
            }
        }
        metrics::gauge!("proxy_healthy").set(if healthy { 1.0 } else { 0.0 });
        if healthy {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
        health
    }

    async fn classify(&self) -> ProxyHealth {
        if self.admin.check_health().await.is_ok() {
            return ProxyHealth::Healthy;
        }
        match self.runtime.is_running(self.config.container_name.clone()).await {
            Ok(false) => ProxyHealth::ContainerDown,
            Ok(true) => {
                let command = vec!["pidof".to_string(), self.config.process_name.clone()];
                match self.runtime.exec(self.config.container_name.clone(), command).await {
                    Ok(pids) if !pids.trim().is_empty() => ProxyHealth::Unhealthy,
                    _ => ProxyHealth::ServiceDown,
                }
            }
            Err(e) => {
                warn!("Container runtime probe failed: {e}");
                ProxyHealth::Unknown
            }
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock().expect("health state poisoned");
        HealthSnapshot {
            health: state.health,
            consecutive_failures: state.consecutive_failures,
            last_transition: state.last_transition,
        }
    }

    /// Ask the proxy to re-read its configuration.
    pub async fn reload(&self) -> Result<(), ReloadError> {
        self.admin.signal_reload().await?;
        Ok(())
    }

    pub fn auto_recovery_enabled(&self) -> bool {
        self.auto_recovery.load(Ordering::SeqCst)
    }

    /// Operator action: re-arm automatic recovery after exhaustion.
    pub fn enable_auto_recovery(&self) {
        info!("Automatic recovery re-enabled");
        self.auto_recovery.store(true, Ordering::SeqCst);
    }

    pub fn recovery_history(&self) -> Vec<RecoveryRecord> {
        self.history.lock().expect("history poisoned").iter().cloned().collect()
    }

    /// Run the escalation ladder until the proxy is healthy or the attempt
    /// budget is spent. Only one sequence runs at a time; a concurrent
    /// trigger returns immediately.
    pub async fn recover(&self, reason: &str) -> Result<(), RecoveryError> {
        let Ok(_guard) = self.recovering.try_lock() else {
            info!("Recovery already in progress, coalescing trigger ({reason})");
            return Ok(());
        };
        if !self.auto_recovery_enabled() {
            return Err(RecoveryError::Disabled);
        }
        warn!("Starting proxy recovery: {reason}");
        metrics::counter!("proxy_recoveries_total").increment(1);

        for attempt in 1..=self.config.max_attempts {
            let action = self.pick_action(attempt).await;
            let outcome = self.execute(action).await;
            let message = match &outcome {
                Ok(()) => format!("{action} completed"),
                Err(message) => message.clone(),
            };

            sleep(self.config.grace_period).await;
            let health = self.probe_health().await;
            let success = outcome.is_ok() && health == ProxyHealth::Healthy;
            self.push_history(RecoveryRecord { timestamp: Utc::now(), attempt, action, success, message });

            if success {
                info!("Proxy recovered after {attempt} attempt(s)");
                self.breaker.reset();
                self.events.emit(SystemEvent::ProxyRecovered { attempts: attempt });
                return Ok(());
            }
            if attempt < self.config.max_attempts {
                let backoff = self.backoff(attempt);
                warn!("Recovery attempt {attempt} failed (health {health}), next attempt in {backoff:?}");
                sleep(backoff).await;
            }
        }

        error!("Recovery exhausted after {} attempts, disabling automatic recovery", self.config.max_attempts);
        self.auto_recovery.store(false, Ordering::SeqCst);
        self.events.emit(SystemEvent::RecoveryExhausted { attempts: self.config.max_attempts });
        Err(RecoveryError::MaxAttemptsReached { attempts: self.config.max_attempts })
    }

    async fn pick_action(&self, attempt: u32) -> RecoveryAction {
        let running = self.runtime.is_running(self.config.container_name.clone()).await.unwrap_or(false);
        if !running {
            RecoveryAction::ContainerStart
        } else if attempt < self.config.max_attempts {
            RecoveryAction::ServiceRestart
        } else {
            RecoveryAction::ContainerRestart
        }
    }

    async fn execute(&self, action: RecoveryAction) -> Result<(), String> {
        let container = self.config.container_name.clone();
        match action {
            RecoveryAction::ContainerStart => {
                self.runtime.start(container).await.map_err(|e| format!("container start failed: {e}"))
            }
            RecoveryAction::ServiceRestart => {
                // Reload through the admin socket is preferred; fall back to
                // restarting the service inside the container.
                match self.admin.signal_reload().await {
                    Ok(()) => Ok(()),
                    Err(reload_error) => {
                        warn!("Reload signal failed ({reload_error}), restarting service in container");
                        self.runtime
                            .exec(container, self.config.service_restart_command.clone())
                            .await
                            .map(|_| ())
                            .map_err(|e| format!("service restart failed: {e}"))
                    }
                }
            }
            RecoveryAction::ContainerRestart => {
                self.runtime.restart(container).await.map_err(|e| format!("container restart failed: {e}"))
            }
        }
    }

    fn push_history(&self, record: RecoveryRecord) {
        let mut history = self.history.lock().expect("history poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self.config.backoff_base.saturating_mul(1u32 << exponent);
        raw.mul_f64(rand::thread_rng().gen_range(0.5..=1.0)).min(self.config.backoff_cap)
    }
}
