//! Datagram transport
//!
//! Client side talks to one fixed remote ([`ClientTransport`]); the server
//! side is connectionless and multi-peer ([`ServerTransport`]). Receives take
//! an explicit timeout and return `Ok(None)` when it elapses, so pump loops
//! can poll the shutdown signal between datagrams.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};

use crate::error::NetworkError;

/// Point-to-point datagram association to the server
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Remote endpoint this association is bound to
    fn remote(&self) -> SocketAddr;

    async fn send(&self, frame: &[u8]) -> Result<(), NetworkError>;

    /// Receive one datagram into `buf`; `Ok(None)` on timeout
    async fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, NetworkError>;

    /// Stop accepting I/O. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Connectionless multi-peer datagram socket
#[async_trait]
pub trait ServerTransport: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    async fn send_to(&self, endpoint: SocketAddr, frame: &[u8]) -> Result<(), NetworkError>;

    /// Receive one datagram and its sender; `Ok(None)` on timeout
    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, NetworkError>;

    /// Stop accepting I/O. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Establishes a client association (one attempt)
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ClientTransport>, NetworkError>;
}

/// Binds the server socket
#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, addr: SocketAddr) -> Result<Arc<dyn ServerTransport>, NetworkError>;
}

/// Connected UDP socket
pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
    closed: AtomicBool,
}

#[async_trait]
impl ClientTransport for UdpLink {
    fn remote(&self) -> SocketAddr {
        self.remote
    }

    async fn send(&self, frame: &[u8]) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        self.socket
            .send(frame)
            .await
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed {
                reason: e.to_string(),
            })
    }

    async fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        match tokio::time::timeout(timeout, self.socket.recv(buf)).await {
            Ok(Ok(len)) => Ok(Some(len)),
            Ok(Err(e)) => Err(NetworkError::ReceiveFailed {
                reason: e.to_string(),
            }),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("UDP association to {} closed", self.remote);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Resolves the endpoint and connects a fresh UDP socket to it
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpConnector;

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ClientTransport>, NetworkError> {
        // Resolved on every attempt so DNS changes are picked up between retries
        let remote = lookup_host(endpoint)
            .await
            .map_err(|e| NetworkError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: format!("resolve: {}", e),
            })?
            .next()
            .ok_or_else(|| NetworkError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "no addresses resolved".to_string(),
            })?;

        // Let the OS choose a port
        let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;

        socket
            .connect(remote)
            .await
            .map_err(|e| NetworkError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(UdpLink {
            socket,
            remote,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Unconnected UDP socket serving many peers
pub struct UdpListener {
    socket: UdpSocket,
    local: SocketAddr,
    closed: AtomicBool,
}

#[async_trait]
impl ServerTransport for UdpListener {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send_to(&self, endpoint: SocketAddr, frame: &[u8]) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        self.socket
            .send_to(frame, endpoint)
            .await
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed {
                reason: format!("{}: {}", endpoint, e),
            })
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(Ok(received)) => Ok(Some(received)),
            Ok(Err(e)) => Err(NetworkError::ReceiveFailed {
                reason: e.to_string(),
            }),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("UDP listener on {} closed", self.local);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpBinder;

#[async_trait]
impl Binder for UdpBinder {
    async fn bind(&self, addr: SocketAddr) -> Result<Arc<dyn ServerTransport>, NetworkError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local = socket.local_addr()?;

        tracing::info!("Server listening on UDP {}", local);

        Ok(Arc::new(UdpListener {
            socket,
            local,
            closed: AtomicBool::new(false),
        }))
    }
}
