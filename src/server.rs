//! Tunnel server orchestration
//!
//! Ordered startup:
//! - Key into the AEAD codec
//! - TUN device acquisition
//! - UDP bind
//! - Forwarding pumps, eviction sweep and traffic reporter
//!
//! Any peer whose datagrams open under the shared key is registered on
//! first contact; every packet read from the TUN device is broadcast to
//! all registered peers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::TunnelConfig;
use crate::crypto::SealCodec;
use crate::error::{Result, SealTunError};
use crate::forward::{self, PumpContext};
use crate::session::registry::{self, EVICTION_INTERVAL};
use crate::session::PeerRegistry;
use crate::shutdown::Shutdown;
use crate::stats::{self, TrafficStats, REPORT_INTERVAL};
use crate::transport::{Binder, ServerTransport, UdpBinder};
use crate::tunnel::{InterfaceFactory, PacketInterface, TunFactory};

/// Tunnel server
pub struct TunnelServer {
    /// Configuration
    config: TunnelConfig,
    /// Opens the TUN device
    factory: Arc<dyn InterfaceFactory>,
    /// Binds the UDP socket
    binder: Arc<dyn Binder>,
    /// Active peers
    registry: Arc<PeerRegistry>,
    /// Stop signal shared with every task
    shutdown: Shutdown,
    stats: Arc<TrafficStats>,
    /// TUN device, once acquired
    interface: Option<Arc<dyn PacketInterface>>,
    /// UDP socket, once bound
    socket: Option<Arc<dyn ServerTransport>>,
    /// Pumps, eviction sweep and reporter
    tasks: Vec<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl TunnelServer {
    /// Create a server backed by a real TUN device and UDP socket
    pub fn new(config: TunnelConfig) -> Self {
        let factory = Arc::new(TunFactory::new(&config.interface));
        Self::with_parts(config, factory, Arc::new(UdpBinder))
    }

    /// Create a server from explicit collaborators
    pub fn with_parts(
        config: TunnelConfig,
        factory: Arc<dyn InterfaceFactory>,
        binder: Arc<dyn Binder>,
    ) -> Self {
        Self {
            config,
            factory,
            binder,
            registry: Arc::new(PeerRegistry::new()),
            shutdown: Shutdown::new(),
            stats: Arc::new(TrafficStats::new()),
            interface: None,
            socket: None,
            tasks: Vec::new(),
            started: false,
            stopped: false,
        }
    }

    /// Bring the tunnel up; returns once the pumps are running
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(SealTunError::AlreadyStarted);
        }
        self.started = true;

        tracing::info!("Starting tunnel server: {}", self.config);

        let bind_addr = self.config.bind_addr()?;
        let codec = Arc::new(SealCodec::new(&self.config.tunnel.preshared_key)?);

        let interface = self.factory.open().await?;

        let socket = match self.binder.bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                interface.close().await;
                return Err(e.into());
            }
        };

        self.interface = Some(Arc::clone(&interface));
        self.socket = Some(Arc::clone(&socket));

        let ctx = PumpContext {
            codec,
            interface,
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.clone(),
        };

        self.tasks.push(tokio::spawn(forward::server_egress(
            ctx.clone(),
            Arc::clone(&socket),
            Arc::clone(&self.registry),
        )));
        self.tasks.push(tokio::spawn(forward::server_ingress(
            ctx,
            Arc::clone(&socket),
            Arc::clone(&self.registry),
        )));
        self.tasks.push(tokio::spawn(registry::run_eviction(
            Arc::clone(&self.registry),
            EVICTION_INTERVAL,
            self.config.tunnel.peer_timeout,
            self.shutdown.subscribe(),
        )));
        self.tasks.push(tokio::spawn(stats::run_reporter(
            Arc::clone(&self.stats),
            Some(Arc::clone(&self.registry)),
            REPORT_INTERVAL,
            self.shutdown.subscribe(),
        )));

        tracing::info!(
            "Server ready on {} (peer timeout {:?})",
            socket.local_addr(),
            self.config.tunnel.peer_timeout
        );
        Ok(())
    }

    /// Tear the tunnel down
    ///
    /// Waits for every task to exit before closing the socket and the TUN
    /// device. Safe to call more than once.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.shutdown.trigger();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Server task ended abnormally: {}", e);
            }
        }

        if let Some(socket) = self.socket.take() {
            socket.close().await;
        }
        if let Some(interface) = self.interface.take() {
            interface.close().await;
        }

        tracing::info!("Tunnel server stopped");
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

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        Arc::clone(&self.stats)
    }

    /// Bound socket address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|socket| socket.local_addr())
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
