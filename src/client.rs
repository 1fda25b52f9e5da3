//! Tunnel client orchestration
//!
//! Ordered startup:
//! - Key into the AEAD codec
//! - TUN device acquisition
//! - Connection to the server (bounded retries)
//! - Forwarding pumps and the traffic reporter
//!
//! A failing step releases whatever the earlier steps acquired before the
//! error is returned.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::TunnelConfig;
use crate::crypto::SealCodec;
use crate::error::{Result, SealTunError};
use crate::forward::{self, PumpContext};
use crate::session::{ConnectionState, ConnectionSupervisor, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::stats::{self, TrafficStats, REPORT_INTERVAL};
use crate::transport::{Connector, UdpConnector};
use crate::tunnel::{InterfaceFactory, PacketInterface, TunFactory};

/// Tunnel client
pub struct TunnelClient {
    /// Configuration
    config: TunnelConfig,
    /// Opens the TUN device
    factory: Arc<dyn InterfaceFactory>,
    /// Owns the association to the server
    supervisor: ConnectionSupervisor,
    /// Stop signal shared with every task
    shutdown: Shutdown,
    stats: Arc<TrafficStats>,
    /// TUN device, once acquired
    interface: Option<Arc<dyn PacketInterface>>,
    /// Pumps and reporter
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl TunnelClient {
    /// Create a client backed by a real TUN device and UDP socket
    pub fn new(config: TunnelConfig) -> Self {
        let factory = Arc::new(TunFactory::new(&config.interface));
        let policy = config.retry_policy();
        Self::with_parts(config, factory, Arc::new(UdpConnector), policy)
    }

    /// Create a client from explicit collaborators
    pub fn with_parts(
        config: TunnelConfig,
        factory: Arc<dyn InterfaceFactory>,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
    ) -> Self {
        let supervisor =
            ConnectionSupervisor::new(config.tunnel.server_address.clone(), connector, policy);

        Self {
            config,
            factory,
            supervisor,
            shutdown: Shutdown::new(),
            stats: Arc::new(TrafficStats::new()),
            interface: None,
            tasks: Vec::new(),
            started: false,
            stopped: false,
        }
    }

    /// Bring the tunnel up
    ///
    /// Returns once the pumps are running. Fails with
    /// [`NetworkError::Cancelled`](crate::error::NetworkError::Cancelled) if
    /// the shutdown handle fires while the server is still being reached.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(SealTunError::AlreadyStarted);
        }
        self.started = true;

        tracing::info!("Starting tunnel client: {}", self.config);

        let codec = Arc::new(SealCodec::new(&self.config.tunnel.preshared_key)?);

        let interface = self.factory.open().await?;

        let mut listener = self.shutdown.subscribe();
        let link = match self.supervisor.connect(&mut listener).await {
            Ok(link) => link,
            Err(e) => {
                interface.close().await;
                return Err(e.into());
            }
        };

        self.interface = Some(Arc::clone(&interface));

        let ctx = PumpContext {
            codec,
            interface,
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.clone(),
        };

        self.tasks.push(tokio::spawn(forward::client_egress(
            ctx.clone(),
            Arc::clone(&link),
        )));
        self.tasks
            .push(tokio::spawn(forward::client_ingress(ctx, Arc::clone(&link))));
        self.tasks.push(tokio::spawn(stats::run_reporter(
            Arc::clone(&self.stats),
            None,
            REPORT_INTERVAL,
            self.shutdown.subscribe(),
        )));

        tracing::info!("Tunnel up: {} <-> {}", self.interface_name(), link.remote());
        Ok(())
    }

    /// Tear the tunnel down
    ///
    /// Waits for every task to exit before closing the transport and the
    /// TUN device. Safe to call more than once.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shutdown.trigger();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Tunnel task ended abnormally: {}", e);
            }
        }

        self.supervisor.disconnect().await;

        if let Some(interface) = self.interface.take() {
            interface.close().await;
        }

        tracing::info!("Tunnel client stopped");
    }

    /// Resolves once shutdown has been requested, by the owner or by a
    /// pump hitting a fatal error
    pub async fn closed(&self) {
        self.shutdown.subscribe().wait().await;
    }

    /// Handle that stops the tunnel from another task
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        Arc::clone(&self.stats)
    }

    fn interface_name(&self) -> &str {
        self.interface
            .as_deref()
            .map(|interface| interface.name())
            .unwrap_or("<none>")
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        // Spawned tasks must not outlive their owner
        self.shutdown.trigger();
    }
}
