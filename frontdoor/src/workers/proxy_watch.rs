use crate::{
    resilience::breaker::CircuitState,
    services::lifecycle::{ProxyHealth, ProxyLifecycle},
};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

/// Periodic health probe of the sibling proxy. When the lifecycle breaker
/// opens, the recovery escalator is triggered; triggers coalesce inside the
/// lifecycle while a sequence is running.
pub struct ProxyWatcher;

impl ProxyWatcher {
    pub fn spawn(lifecycle: Arc<ProxyLifecycle>, period: Duration) {
        info!("Spawning proxy health watcher with period {period:?}");
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let health = lifecycle.probe_health().await;
                if health == ProxyHealth::Healthy {
                    continue;
                }
                if lifecycle.breaker().state() == CircuitState::Open && lifecycle.auto_recovery_enabled() {
                    if let Err(e) = lifecycle.recover("health probe breaker open").await {
                        error!("Proxy recovery failed: {e}");
                    }
                }
            }
        });
    }
}
