use crate::services::{certificates::RenewScanOptions, orchestrator::Orchestrator};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

/// Periodically runs the certificate renewal scan; renewed material is synced
/// to the proxy and followed by a reload inside the orchestrator.
pub struct RenewalWorker;

impl RenewalWorker {
    pub fn spawn(orchestrator: Arc<Orchestrator>, period: Duration, renew_before_days: i64) {
        info!("Spawning certificate renewal scheduler with period {period:?}");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The startup reconcile already synced certificates; wait one full
            // period before the first scan.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let options = RenewScanOptions { force_all: false, renew_before_days: Some(renew_before_days) };
                match orchestrator.renew_certificates(options).await {
                    Ok(report) if report.renewed > 0 || report.failed > 0 => {
                        info!(
                            "Renewal scan: {} renewed, {} failed, {} skipped",
                            report.renewed, report.failed, report.skipped
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        metrics::counter!("cert_renewal_scan_errors_total").increment(1);
                        error!("Renewal scan failed: {e}");
                    }
                }
            }
        });
    }
}
