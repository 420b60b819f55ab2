use crate::services::optimizer::{LoadOptimizer, PassKind};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

/// Drives the load optimizer: one scheduled pass per tick, plus an immediate
/// out-of-band pass at the raised adaptation rate when a backend crossed the
/// emergency thresholds.
pub struct OptimizerWorker {
    optimizer: Arc<LoadOptimizer>,
}

impl OptimizerWorker {
    pub fn spawn(optimizer: Arc<LoadOptimizer>, period: Duration) {
        info!("Spawning load optimizer with period {period:?}");
        let worker = Self { optimizer };
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                worker.tick().await;
            }
        });
    }

    async fn tick(&self) {
        let outcome = match self.optimizer.run_once(PassKind::Scheduled).await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::counter!("optimizer_pass_errors_total").increment(1);
                error!("Optimization pass failed: {e}");
                return;
            }
        };
        if outcome.emergency_backends.is_empty() {
            return;
        }
        warn!("Emergency thresholds crossed by {:?}, running out-of-band pass", outcome.emergency_backends);
        if let Err(e) = self.optimizer.run_once(PassKind::Emergency).await {
            metrics::counter!("optimizer_pass_errors_total").increment(1);
            error!("Emergency optimization pass failed: {e}");
        }
    }
}
