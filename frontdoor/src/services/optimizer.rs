use crate::{
    clients::proxy_admin::{BackendStats, ProxyAdminClient, ProxyAdminError, ServerStats},
    events::{EventBus, SystemEvent},
};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::Deserialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};
use tracing::{debug, info, warn};

const PATTERN_EMA_ALPHA: f64 = 0.3;
const TREND_BIAS: f64 = 0.25;
const TREND_SLOPE_EPSILON: f64 = 0.05;
const MIN_TREND_SAMPLES: usize = 5;
const SAMPLE_WINDOW: usize = 30;
const HISTORY_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerAlgorithm {
    /// Composite scoring of response time, errors, queue depth and utilization.
    Adaptive,

    /// Adaptive plus time-of-day patterns and a load-trend bias.
    Predictive,

    /// Connection-count balancing only.
    Balanced,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: OptimizerAlgorithm,

    /// The cadence of scheduled optimization passes.
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: std::time::Duration,

    #[serde(default = "default_adaptation_rate")]
    pub adaptation_rate: f64,

    #[serde(default = "default_emergency_adaptation_rate")]
    pub emergency_adaptation_rate: f64,

    /// Proposed changes smaller than this many weight units are dropped.
    #[serde(default = "default_min_change")]
    pub min_change: u32,

    #[serde(default = "default_min_weight")]
    pub min_weight: u32,

    #[serde(default = "default_max_weight")]
    pub max_weight: u32,

    #[serde(default = "default_performance_weight")]
    pub performance_weight: f64,

    #[serde(default = "default_utilization_weight")]
    pub utilization_weight: f64,

    #[serde(default = "default_stability_weight")]
    pub stability_weight: f64,

    #[serde(default = "default_emergency_queue_threshold")]
    pub emergency_queue_threshold: u64,

    #[serde(default = "default_emergency_utilization_threshold")]
    pub emergency_utilization_threshold: f64,
}

fn default_algorithm() -> OptimizerAlgorithm {
    OptimizerAlgorithm::Adaptive
}
fn default_interval() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}
fn default_adaptation_rate() -> f64 {
    0.3
}
fn default_emergency_adaptation_rate() -> f64 {
    0.6
}
fn default_min_change() -> u32 {
    5
}
fn default_min_weight() -> u32 {
    1
}
fn default_max_weight() -> u32 {
    256
}
fn default_performance_weight() -> f64 {
    0.5
}
fn default_utilization_weight() -> f64 {
    0.3
}
fn default_stability_weight() -> f64 {
    0.2
}
fn default_emergency_queue_threshold() -> u64 {
    5
}
fn default_emergency_utilization_threshold() -> f64 {
    0.8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            interval: default_interval(),
            adaptation_rate: default_adaptation_rate(),
            emergency_adaptation_rate: default_emergency_adaptation_rate(),
            min_change: default_min_change(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            performance_weight: default_performance_weight(),
            utilization_weight: default_utilization_weight(),
            stability_weight: default_stability_weight(),
            emergency_queue_threshold: default_emergency_queue_threshold(),
            emergency_utilization_threshold: default_emergency_utilization_threshold(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WeightChange {
    pub backend: String,
    pub server: String,
    pub current_weight: u32,
    pub proposed_weight: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PassKind {
    Scheduled,
    Emergency,
}

#[derive(Clone, Debug, Default)]
pub struct OptimizationOutcome {
    pub changes_applied: usize,
    pub emergency_backends: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct OptimizationRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: PassKind,
    pub changes: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TrafficPattern {
    pub ema_connections: f64,
    pub ema_sessions: f64,
    pub ema_queue: f64,
    pub samples: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("proxy admin: {0}")]
    Admin(#[from] ProxyAdminError),

    #[error("weight transaction {transaction} aborted: {source}")]
    TransactionAborted { transaction: String, source: ProxyAdminError },
}

#[derive(Default)]
struct OptimizerState {
    patterns: HashMap<(Weekday, u32), TrafficPattern>,
    samples: HashMap<String, VecDeque<(i64, f64)>>,
    history: VecDeque<OptimizationRecord>,
}

/// Periodically rewrites server weights in the proxy from sampled backend
/// performance. All changes of one pass are applied in a single admin-API
/// transaction; partial failure aborts the whole pass.
pub struct LoadOptimizer {
    admin: Arc<dyn ProxyAdminClient>,
    events: EventBus,
    config: OptimizerConfig,
    state: Mutex<OptimizerState>,
}

impl LoadOptimizer {
    pub fn new(admin: Arc<dyn ProxyAdminClient>, events: EventBus, config: OptimizerConfig) -> Self {
        Self { admin, events, config, state: Mutex::new(OptimizerState::default()) }
    }

    /// One optimization pass: sample stats, plan weight changes, apply them
    /// transactionally. Returns the backends that need an emergency pass.
    pub async fn run_once(&self, kind: PassKind) -> Result<OptimizationOutcome, OptimizerError> {
        let stats = self.admin.read_stats().await?;
        let now = Utc::now();
        let emergency_backends = self.detect_emergency(&stats);

        let trending: HashMap<String, f64> = {
            let mut state = self.state.lock().expect("optimizer state poisoned");
            update_patterns(&mut state.patterns, now, &stats);
            update_samples(&mut state.samples, now, &stats);
            state
                .samples
                .iter()
                .filter_map(|(backend, samples)| trend_slope(samples).map(|slope| (backend.clone(), slope)))
                .collect()
        };

        let alpha = match kind {
            PassKind::Scheduled => self.config.adaptation_rate,
            PassKind::Emergency => self.config.emergency_adaptation_rate,
        };
        let mut changes = Vec::new();
        for backend in &stats {
            let trend = match self.config.algorithm {
                OptimizerAlgorithm::Predictive => trending.get(&backend.backend).copied(),
                _ => None,
            };
            changes.extend(plan_backend(&self.config, backend, alpha, trend));
        }

        if !changes.is_empty() {
            self.apply(&changes).await?;
            metrics::counter!("optimizer_weight_changes_total").increment(changes.len() as u64);
            let mut touched: Vec<&str> = changes.iter().map(|c| c.backend.as_str()).collect();
            touched.dedup();
            for backend in touched {
                let count = changes.iter().filter(|c| c.backend == backend).count();
                self.events.emit(SystemEvent::WeightsApplied { backend: backend.to_string(), changes: count });
            }
        }
        for backend in &emergency_backends {
            self.events.emit(SystemEvent::EmergencyOptimization { backend: backend.clone() });
        }

        let mut state = self.state.lock().expect("optimizer state poisoned");
        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(OptimizationRecord { timestamp: now, kind, changes: changes.len() });
        debug!("Optimization pass ({kind}) applied {} change(s)", changes.len());
        Ok(OptimizationOutcome { changes_applied: changes.len(), emergency_backends })
    }

    /// Backends whose queues or utilization crossed the emergency thresholds.
    fn detect_emergency(&self, stats: &[BackendStats]) -> Vec<String> {
        stats
            .iter()
            .filter(|backend| {
                backend.servers.iter().any(|server| {
                    let overloaded = server.max_connections > 0
                        && server.current_connections as f64 / server.max_connections as f64
                            > self.config.emergency_utilization_threshold;
                    server.queue_length > self.config.emergency_queue_threshold || overloaded
                })
            })
            .map(|backend| backend.backend.clone())
            .collect()
    }

    async fn apply(&self, changes: &[WeightChange]) -> Result<(), OptimizerError> {
        let transaction = self.admin.begin_transaction().await?;
        for change in changes {
            let result = async {
                self.admin
                    .read_server(transaction.clone(), change.backend.clone(), change.server.clone())
                    .await?;
                self.admin
                    .update_server_weight(
                        transaction.clone(),
                        change.backend.clone(),
                        change.server.clone(),
                        change.proposed_weight,
                    )
                    .await
            }
            .await;
            if let Err(source) = result {
                warn!("Aborting weight transaction {transaction}: {source}");
                if let Err(abort_error) = self.admin.abort_transaction(transaction.clone()).await {
                    warn!("Failed to abort transaction {transaction}: {abort_error}");
                }
                return Err(OptimizerError::TransactionAborted { transaction, source });
            }
        }
        self.admin.commit_transaction(transaction).await?;
        info!("Applied {} weight change(s)", changes.len());
        Ok(())
    }

    pub fn history(&self) -> Vec<OptimizationRecord> {
        self.state.lock().expect("optimizer state poisoned").history.iter().cloned().collect()
    }

    pub fn pattern_for(&self, weekday: Weekday, hour: u32) -> Option<TrafficPattern> {
        self.state.lock().expect("optimizer state poisoned").patterns.get(&(weekday, hour)).copied()
    }
}

fn update_patterns(patterns: &mut HashMap<(Weekday, u32), TrafficPattern>, now: DateTime<Utc>, stats: &[BackendStats]) {
    let key = (now.weekday(), now.hour());
    let connections: f64 = stats.iter().flat_map(|b| &b.servers).map(|s| s.current_connections as f64).sum();
    let sessions: f64 = stats.iter().flat_map(|b| &b.servers).map(|s| s.total_sessions as f64).sum();
    let queue: f64 = stats.iter().flat_map(|b| &b.servers).map(|s| s.queue_length as f64).sum();

    let pattern = patterns.entry(key).or_default();
    if pattern.samples == 0 {
        *pattern = TrafficPattern { ema_connections: connections, ema_sessions: sessions, ema_queue: queue, samples: 1 };
    } else {
        pattern.ema_connections += PATTERN_EMA_ALPHA * (connections - pattern.ema_connections);
        pattern.ema_sessions += PATTERN_EMA_ALPHA * (sessions - pattern.ema_sessions);
        pattern.ema_queue += PATTERN_EMA_ALPHA * (queue - pattern.ema_queue);
        pattern.samples += 1;
    }
}

fn update_samples(samples: &mut HashMap<String, VecDeque<(i64, f64)>>, now: DateTime<Utc>, stats: &[BackendStats]) {
    for backend in stats {
        let connections: f64 = backend.servers.iter().map(|s| s.current_connections as f64).sum();
        let window = samples.entry(backend.backend.clone()).or_default();
        if window.len() == SAMPLE_WINDOW {
            window.pop_front();
        }
        window.push_back((now.timestamp(), connections));
    }
}

/// Least-squares slope of connections over time, in connections per minute.
/// `None` until enough samples accumulated.
fn trend_slope(samples: &VecDeque<(i64, f64)>) -> Option<f64> {
    if samples.len() < MIN_TREND_SAMPLES {
        return None;
    }
    let n = samples.len() as f64;
    let t0 = samples.front().expect("nonempty").0;
    let xs: Vec<f64> = samples.iter().map(|(t, _)| (*t - t0) as f64 / 60.0).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, (_, y)) in xs.iter().zip(samples.iter()) {
        numerator += (x - mean_x) * (y - mean_y);
        denominator += (x - mean_x) * (x - mean_x);
    }
    if denominator == 0.0 { None } else { Some(numerator / denominator) }
}

fn response_score(response_time_ms: Option<f64>) -> f64 {
    match response_time_ms {
        None => 100.0,
        Some(ms) => 100.0 / (1.0 + ms.max(1.0).log10()),
    }
}

fn error_score(error_count: u64, total_sessions: u64) -> f64 {
    let rate = if total_sessions == 0 { 0.0 } else { error_count as f64 / total_sessions as f64 * 100.0 };
    100.0 - (rate * 20.0).min(100.0)
}

fn queue_score(queue_length: u64) -> f64 {
    100.0 / (1.0 + queue_length as f64)
}

fn utilization_score(current: u64, max: u64) -> f64 {
    if max > 0 { (100.0 * (1.0 - current as f64 / max as f64)).max(0.0) } else { 50.0 }
}

fn composite_score(config: &OptimizerConfig, server: &ServerStats) -> f64 {
    let performance = 0.5 * response_score(server.response_time_ms)
        + 0.3 * error_score(server.error_count, server.total_sessions)
        + 0.2 * queue_score(server.queue_length);
    let utilization = utilization_score(server.current_connections, server.max_connections);
    let stability = server.weight as f64 * 100.0 / config.max_weight as f64;

    let total = config.performance_weight + config.utilization_weight + config.stability_weight;
    (config.performance_weight * performance + config.utilization_weight * utilization + config.stability_weight * stability)
        / total
}

fn headroom(server: &ServerStats) -> f64 {
    if server.max_connections == 0 {
        0.5
    } else {
        (1.0 - server.current_connections as f64 / server.max_connections as f64).clamp(0.0, 1.0)
    }
}

/// Plan the weight changes for one backend. `trend` biases weight toward
/// servers with headroom when load is trending up (predictive mode).
fn plan_backend(config: &OptimizerConfig, backend: &BackendStats, alpha: f64, trend: Option<f64>) -> Vec<WeightChange> {
    let up: Vec<&ServerStats> = backend.servers.iter().filter(|s| s.up).collect();
    if up.is_empty() {
        return Vec::new();
    }
    let scores: Vec<f64> = up
        .iter()
        .map(|server| match config.algorithm {
            OptimizerAlgorithm::Balanced => 100.0 / (1.0 + server.current_connections as f64),
            _ => composite_score(config, server),
        })
        .collect();
    let total: f64 = scores.iter().sum();
    let trending_up = trend.is_some_and(|slope| slope > TREND_SLOPE_EPSILON);

    let mut changes = Vec::new();
    for (server, score) in up.iter().zip(scores) {
        let share = if total > 0.0 { score / total } else { 1.0 / up.len() as f64 };
        let mut target = share * up.len() as f64 * 100.0;
        if trending_up {
            target *= 1.0 + TREND_BIAS * headroom(server);
        }
        let target = target.clamp(config.min_weight as f64, config.max_weight as f64);

        let current = server.weight as f64;
        let proposed = (current + alpha * (target - current)).round();
        let proposed = (proposed as u32).clamp(config.min_weight, config.max_weight);
        if proposed.abs_diff(server.weight) >= config.min_change {
            changes.push(WeightChange {
                backend: backend.backend.clone(),
                server: server.name.clone(),
                current_weight: server.weight,
                proposed_weight: proposed,
            });
        }
    }
    changes
}
