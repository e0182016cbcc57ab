//! Shared application state for the conductor server.

use std::sync::Arc;

use conductor::io::capability::CapabilityExecutor;
use conductor::io::config::ConductorConfig;
use conductor::io::cost::CostEstimator;
use conductor::io::notifier::BroadcastNotifier;
use conductor::orchestrator::{Collaborators, Orchestrator};
use conductor::queue::AdmissionQueue;
use conductor::trace::RequestTracer;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Lifecycle events fanned out to SSE clients.
    pub events: BroadcastNotifier,
}

impl AppState {
    /// Wire queue, tracer and orchestrator from config around the given backends.
    pub fn from_config(
        config: &ConductorConfig,
        executor: Arc<dyn CapabilityExecutor>,
        cost: Arc<dyn CostEstimator>,
    ) -> Self {
        let events = BroadcastNotifier::new(config.notifier.buffer);
        let notifier = Arc::new(events.clone());
        let queue = Arc::new(AdmissionQueue::new(config.queue_config()));
        let tracer = Arc::new(RequestTracer::new(notifier.clone()));
        let orchestrator = Orchestrator::new(
            config.orchestrator_config(),
            queue,
            tracer,
            Collaborators {
                executor,
                cost,
                notifier,
            },
        );
        Self {
            orchestrator,
            events,
        }
    }
}
