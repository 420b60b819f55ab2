use chrono::{DateTime, Utc};
use strum::EnumDiscriminants;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the background subsystems and the orchestrator.
#[derive(Clone, Debug, EnumDiscriminants)]
pub enum SystemEvent {
    RouteAdded { agent_id: String, domain: String },
    RouteRemoved { agent_id: String },
    CertificateWarning { agent_id: String, days_until_expiry: i64 },
    CertificateExpired { agent_id: String, expired_at: DateTime<Utc> },
    CertificatesChecked { checked: u64, warnings: u64, expired: u64 },
    BreakerStateChanged { name: String, state: String },
    ProxyUnhealthy { health: String, consecutive_failures: u32 },
    ProxyRecovered { attempts: u32 },
    RecoveryExhausted { attempts: u32 },
    WeightsApplied { backend: String, changes: usize },
    EmergencyOptimization { backend: String },
}

/// A broadcast fan-out for [`SystemEvent`]s. Cheap to clone; emitting with no
/// subscribers is not an error.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: SystemEvent) {
        let discriminant = SystemEventDiscriminants::from(&event);
        debug!("Emitting {discriminant:?} event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
