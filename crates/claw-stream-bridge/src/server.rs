//! Bridge service: HTTP server plus the supervised engine.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::routes::create_router;
use crate::state::BridgeState;

/// Owns the engine supervisor, the broadcast hub and the inbound router, and
/// serves them over HTTP.
///
/// Construction fails if the engine path cannot be resolved. The engine is
/// started by [`serve_with_shutdown`](Self::serve_with_shutdown) once the
/// listener is bound, and stopped after the server has drained.
#[derive(Debug, Clone)]
pub struct BridgeService {
    state: Arc<BridgeState>,
}

impl BridgeService {
    /// Create a bridge from `config`.
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let state = Arc::new(BridgeState::new(config)?);
        Ok(Self { state })
    }

    /// Get the bridge state for external access.
    #[must_use]
    pub fn state(&self) -> Arc<BridgeState> {
        self.state.clone()
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> BridgeResult<TcpListener> {
        let addr = self.state.config().bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::BindFailed(addr, e))
    }

    /// Bind, start the engine and serve until `shutdown` completes.
    pub async fn run<F>(&self, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind().await?;
        self.serve_with_shutdown(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` completes.
    ///
    /// When `shutdown` fires, new subscriptions and messages are refused and
    /// open streams end so the server can drain; the engine is stopped last.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listener.local_addr()?;
        info!(
            addr = %addr,
            engine = %self.state.engine_path().display(),
            "bridge listening"
        );

        self.state.start();

        let state = self.state.clone();
        let signal = async move {
            shutdown.await;
            info!("shutdown requested");
            state.close_intake();
        };

        let served = axum::serve(listener, create_router(self.state.clone()))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| BridgeError::Internal(e.to_string()));

        self.state.shutdown().await;
        info!("bridge shut down");
        served
    }

    /// Close intake and stop the engine.
    pub async fn shutdown(&self) {
        self.state.shutdown().await;
    }

    /// Create the router without starting the server.
    ///
    /// Useful for testing or embedding in another server.
    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }
}
