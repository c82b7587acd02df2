//! Shared state behind the HTTP surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::hub::{BroadcastHub, Subscription};
use crate::router::{Envelope, InboundRouter};
use crate::supervisor::{EngineSupervisor, SupervisorConfig, SupervisorStatus};

/// Everything a request handler needs: the hub, the router and the supervisor.
#[derive(Debug)]
pub struct BridgeState {
    config: Arc<BridgeConfig>,
    engine_path: PathBuf,
    hub: BroadcastHub,
    router: InboundRouter,
    supervisor: EngineSupervisor,
    start_time: Instant,
}

impl BridgeState {
    /// Validate `config` and wire the components together.
    ///
    /// The engine is not started; see [`start`](Self::start).
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let engine_path = config.validate()?;

        let hub = BroadcastHub::new(config.client_queue_capacity);
        let mut supervisor_config = SupervisorConfig::from(&config);
        supervisor_config.program = engine_path.clone();
        let supervisor = EngineSupervisor::new(supervisor_config, Arc::new(hub.clone()));
        let router = InboundRouter::new(supervisor.current(), config.router_queue_capacity);

        Ok(Self {
            config: Arc::new(config),
            engine_path,
            hub,
            router,
            supervisor,
            start_time: Instant::now(),
        })
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Resolved engine executable.
    #[must_use]
    pub fn engine_path(&self) -> &Path {
        &self.engine_path
    }

    /// Get the broadcast hub.
    #[must_use]
    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Get the engine supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &EngineSupervisor {
        &self.supervisor
    }

    /// Supervisor snapshot.
    #[must_use]
    pub fn engine_status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    /// Get server uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Start supervising the engine.
    pub fn start(&self) {
        self.supervisor.start();
    }

    /// Attach a streaming client.
    pub fn subscribe(&self) -> BridgeResult<Subscription> {
        self.hub.attach()
    }

    /// Forward one envelope to the engine.
    pub fn submit(&self, envelope: &Envelope) -> BridgeResult<()> {
        self.router.submit(envelope)
    }

    /// Stop taking new subscriptions and messages; end open streams.
    pub fn close_intake(&self) {
        if self.router.is_accepting() {
            info!("closing bridge intake");
        }
        self.router.close();
        self.hub.close();
    }

    /// Close intake and stop the engine for good.
    pub async fn shutdown(&self) {
        self.close_intake();
        self.supervisor.stop().await;
    }
}
