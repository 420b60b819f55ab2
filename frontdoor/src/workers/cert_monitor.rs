use crate::{
    events::{EventBus, SystemEvent},
    services::certificates::{AgentCertificateRecord, CertificateError, CertificateService},
};
use chrono::{DateTime, Utc};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

const FAILURE_HISTORY_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CertificateStatus {
    Good,
    Warning,
    Expired,
    Invalid,
    Unknown,
}

#[derive(Clone, Debug, Default)]
pub struct ScanSummary {
    pub checked: u64,
    pub good: u64,
    pub warnings: u64,
    pub expired: u64,
    pub invalid: u64,
    pub unknown: u64,
}

#[derive(Clone, Debug)]
pub struct MonitorFailure {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub reason: String,
}

#[derive(Default)]
struct MonitorState {
    last_summary: Option<ScanSummary>,
    last_scan: Option<DateTime<Utc>>,
    scans: u64,
    failures: VecDeque<MonitorFailure>,
}

/// Background scanner over the agent certificate set. Classifies each leaf,
/// keeps aggregate counters, and emits warning/expiry events.
pub struct CertificateMonitor {
    certificates: Arc<dyn CertificateService>,
    events: EventBus,
    warning_days: i64,
    state: Mutex<MonitorState>,
}

impl CertificateMonitor {
    pub fn new(certificates: Arc<dyn CertificateService>, events: EventBus, warning_days: i64) -> Arc<Self> {
        Arc::new(Self { certificates, events, warning_days, state: Mutex::new(MonitorState::default()) })
    }

    /// Run a scan immediately, then on every tick.
    pub fn spawn(self: &Arc<Self>, period: Duration) {
        let monitor = self.clone();
        info!("Spawning certificate monitor with period {period:?}");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = monitor.scan().await {
                    metrics::counter!("cert_monitor_scan_errors_total").increment(1);
                    error!("Certificate scan failed: {e}");
                }
            }
        });
    }

    pub async fn scan(&self) -> Result<ScanSummary, CertificateError> {
        let now = Utc::now();
        let records = self.certificates.list_certificates().await?;
        let mut summary = ScanSummary::default();
        let mut failures = Vec::new();

        for record in &records {
            summary.checked += 1;
            match classify(record, now, self.warning_days) {
                CertificateStatus::Good => summary.good += 1,
                CertificateStatus::Warning => {
                    summary.warnings += 1;
                    let metadata = record.metadata.as_ref().expect("warning implies metadata");
                    let days = metadata.days_until_expiry(now);
                    warn!("Certificate for agent '{}' expires in {days} day(s)", record.agent_id);
                    self.events.emit(SystemEvent::CertificateWarning {
                        agent_id: record.agent_id.clone(),
                        days_until_expiry: days,
                    });
                }
                CertificateStatus::Expired => {
                    summary.expired += 1;
                    let metadata = record.metadata.as_ref().expect("expired implies metadata");
                    warn!("Certificate for agent '{}' expired at {}", record.agent_id, metadata.not_after);
                    self.events.emit(SystemEvent::CertificateExpired {
                        agent_id: record.agent_id.clone(),
                        expired_at: metadata.not_after,
                    });
                }
                CertificateStatus::Invalid => {
                    summary.invalid += 1;
                    failures.push(MonitorFailure {
                        timestamp: now,
                        agent_id: record.agent_id.clone(),
                        reason: record.error.clone().unwrap_or_else(|| "invalid certificate".into()),
                    });
                }
                CertificateStatus::Unknown => summary.unknown += 1,
            }
        }

        for (status, value) in [
            ("good", summary.good),
            ("warning", summary.warnings),
            ("expired", summary.expired),
            ("invalid", summary.invalid),
            ("unknown", summary.unknown),
        ] {
            metrics::gauge!("certificates_total", "status" => status).set(value as f64);
        }
        self.events.emit(SystemEvent::CertificatesChecked {
            checked: summary.checked,
            warnings: summary.warnings,
            expired: summary.expired,
        });

        let mut state = self.state.lock().expect("monitor state poisoned");
        state.scans += 1;
        state.last_scan = Some(now);
        state.last_summary = Some(summary.clone());
        for failure in failures {
            if state.failures.len() == FAILURE_HISTORY_CAPACITY {
                state.failures.pop_front();
            }
            state.failures.push_back(failure);
        }
        info!(
            "Certificate scan done: {} checked, {} warning(s), {} expired, {} invalid",
            summary.checked, summary.warnings, summary.expired, summary.invalid
        );
        Ok(summary)
    }

    pub fn last_summary(&self) -> Option<ScanSummary> {
        self.state.lock().expect("monitor state poisoned").last_summary.clone()
    }

    pub fn recent_failures(&self) -> Vec<MonitorFailure> {
        self.state.lock().expect("monitor state poisoned").failures.iter().cloned().collect()
    }
}

fn classify(record: &AgentCertificateRecord, now: DateTime<Utc>, warning_days: i64) -> CertificateStatus {
    if record.error.is_some() {
        return CertificateStatus::Invalid;
    }
    let Some(metadata) = &record.metadata else {
        return CertificateStatus::Unknown;
    };
    let days = metadata.days_until_expiry(now);
    if metadata.not_after <= now {
        CertificateStatus::Expired
    } else if days <= warning_days {
        CertificateStatus::Warning
    } else {
        CertificateStatus::Good
    }
}
