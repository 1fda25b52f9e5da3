//! Channel-backed fakes for the interface and transport seams

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::config::TunnelConfig;
use crate::error::{NetworkError, TunnelError};
use crate::transport::{Binder, ClientTransport, Connector, ServerTransport};
use crate::tunnel::{InterfaceFactory, PacketInterface};

pub const TEST_KEY: &str = "UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=";

/// Minimal valid config for `mode` ("client" or "server")
pub fn test_config(mode: &str, server_address: &str) -> TunnelConfig {
    TunnelConfig::parse(&format!(
        "[Interface]\nAddress = 10.8.0.2/24\n\n[Tunnel]\nMode = {}\nServerAddress = {}\nPreSharedKey = {}\n",
        mode, server_address, TEST_KEY
    ))
    .unwrap()
}

/// Take one from a "fail the next n" counter
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Receive from `rx`, pending forever once every sender is gone
async fn recv_or_pending<T>(rx: &Mutex<UnboundedReceiver<T>>) -> T {
    match rx.lock().await.recv().await {
        Some(item) => item,
        None => std::future::pending().await,
    }
}

/// In-memory TUN device
///
/// `inject` feeds packets to `read_packet`; packets passed to
/// `write_packet` come out of `next_written`.
pub struct MockInterface {
    name: String,
    inbound_tx: UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<UnboundedReceiver<Vec<u8>>>,
    written_tx: UnboundedSender<Vec<u8>>,
    written_rx: Mutex<UnboundedReceiver<Vec<u8>>>,
    read_failures: AtomicU32,
    closed: AtomicBool,
}

impl MockInterface {
    pub fn new(name: &str) -> Self {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let (written_tx, written_rx) = unbounded_channel();
        Self {
            name: name.to_string(),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            written_tx,
            written_rx: Mutex::new(written_rx),
            read_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a packet as if the OS routed it into the tunnel
    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self.inbound_tx.send(packet);
    }

    /// Next packet the tunnel wrote to the OS
    pub async fn next_written(&self) -> Vec<u8> {
        recv_or_pending(&self.written_rx).await
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.read_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl PacketInterface for MockInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        if take_failure(&self.read_failures) {
            return Err(TunnelError::ReadFailed {
                reason: "simulated read failure".to_string(),
            });
        }

        let packet = recv_or_pending(&self.inbound_rx).await;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let _ = self.written_tx.send(packet.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out one prepared [`MockInterface`], or fails
pub struct MockFactory {
    interface: Option<Arc<MockInterface>>,
    opens: AtomicU32,
}

impl MockFactory {
    pub fn new(interface: Arc<MockInterface>) -> Self {
        Self {
            interface: Some(interface),
            opens: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            interface: None,
            opens: AtomicU32::new(0),
        }
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterfaceFactory for MockFactory {
    async fn open(&self) -> Result<Arc<dyn PacketInterface>, TunnelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match &self.interface {
            Some(interface) => Ok(interface.clone()),
            None => Err(TunnelError::CreateFailed {
                reason: "simulated creation failure".to_string(),
            }),
        }
    }
}

/// Far side of a [`MockLink`]
pub struct LinkRemote {
    /// Frames the link sent
    pub sent: UnboundedReceiver<Vec<u8>>,
    inbound: UnboundedSender<Vec<u8>>,
}

impl LinkRemote {
    /// Make `frame` arrive at the link
    pub fn deliver(&self, frame: Vec<u8>) {
        let _ = self.inbound.send(frame);
    }
}

/// In-memory client association
pub struct MockLink {
    remote: SocketAddr,
    sent: UnboundedSender<Vec<u8>>,
    inbound: Mutex<UnboundedReceiver<Vec<u8>>>,
    send_failures: AtomicU32,
    closed: AtomicBool,
}

impl MockLink {
    pub fn pair() -> (Arc<Self>, LinkRemote) {
        let (sent_tx, sent_rx) = unbounded_channel();
        let (inbound_tx, inbound_rx) = unbounded_channel();

        let link = Arc::new(Self {
            remote: SocketAddr::from(([192, 0, 2, 1], 51820)),
            sent: sent_tx,
            inbound: Mutex::new(inbound_rx),
            send_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });
        let remote = LinkRemote {
            sent: sent_rx,
            inbound: inbound_tx,
        };
        (link, remote)
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.send_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientTransport for MockLink {
    fn remote(&self) -> SocketAddr {
        self.remote
    }

    async fn send(&self, frame: &[u8]) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        if take_failure(&self.send_failures) {
            return Err(NetworkError::SendFailed {
                reason: "simulated send failure".to_string(),
            });
        }
        let _ = self.sent.send(frame.to_vec());
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        match tokio::time::timeout(timeout, recv_or_pending(&self.inbound)).await {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Fails the first `fail_first` attempts, then hands out the link
pub struct MockConnector {
    link: Arc<MockLink>,
    fail_first: u32,
    hang_first: bool,
    calls: AtomicU32,
}

impl MockConnector {
    pub fn new(fail_first: u32, link: Arc<MockLink>) -> Self {
        Self {
            link,
            fail_first,
            hang_first: false,
            calls: AtomicU32::new(0),
        }
    }

    /// First attempt never completes; the second succeeds
    pub fn hanging_first(link: Arc<MockLink>) -> Self {
        Self {
            link,
            fail_first: 0,
            hang_first: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ClientTransport>, NetworkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.hang_first && call == 1 {
            std::future::pending::<()>().await;
        }
        if call <= self.fail_first {
            return Err(NetworkError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.link.clone())
    }
}

/// Far side of a [`MockSocket`]
pub struct SocketWire {
    /// `(destination, frame)` for every `send_to`
    pub sent: UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    inbound: UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl SocketWire {
    /// Make `frame` arrive at the socket from `from`
    pub fn deliver(&self, from: SocketAddr, frame: Vec<u8>) {
        let _ = self.inbound.send((from, frame));
    }
}

/// In-memory multi-peer socket
pub struct MockSocket {
    local: SocketAddr,
    sent: UnboundedSender<(SocketAddr, Vec<u8>)>,
    inbound: Mutex<UnboundedReceiver<(SocketAddr, Vec<u8>)>>,
    closed: AtomicBool,
}

impl MockSocket {
    pub fn new(local: SocketAddr) -> (Arc<Self>, SocketWire) {
        let (sent_tx, sent_rx) = unbounded_channel();
        let (inbound_tx, inbound_rx) = unbounded_channel();

        let socket = Arc::new(Self {
            local,
            sent: sent_tx,
            inbound: Mutex::new(inbound_rx),
            closed: AtomicBool::new(false),
        });
        let wire = SocketWire {
            sent: sent_rx,
            inbound: inbound_tx,
        };
        (socket, wire)
    }
}

#[async_trait]
impl ServerTransport for MockSocket {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn send_to(&self, endpoint: SocketAddr, frame: &[u8]) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        let _ = self.sent.send((endpoint, frame.to_vec()));
        Ok(())
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        match tokio::time::timeout(timeout, recv_or_pending(&self.inbound)).await {
            Ok((from, frame)) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some((len, from)))
            }
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out one prepared [`MockSocket`], or fails
pub struct MockBinder {
    socket: Option<Arc<MockSocket>>,
}

impl MockBinder {
    pub fn new(socket: Arc<MockSocket>) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    pub fn failing() -> Self {
        Self { socket: None }
    }
}

#[async_trait]
impl Binder for MockBinder {
    async fn bind(&self, addr: SocketAddr) -> Result<Arc<dyn ServerTransport>, NetworkError> {
        match &self.socket {
            Some(socket) => Ok(socket.clone()),
            None => Err(NetworkError::BindFailed {
                addr: addr.to_string(),
                reason: "address already in use".to_string(),
            }),
        }
    }
}
