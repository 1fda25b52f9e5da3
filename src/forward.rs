//! Packet forwarding pumps
//!
//! Two loops per tunnel, one per direction:
//!
//! ```text
//! egress:  TUN read  -> seal -> send (client) / send_to every peer (server)
//! ingress: recv      -> open -> (server: registry touch) -> TUN write
//! ```
//!
//! Each loop processes packets strictly in read order and exits only when
//! the shared shutdown signal fires, or when an error whose policy is
//! [`ErrorPolicy::Abort`] occurs (which also fires the signal).

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::crypto::SealCodec;
use crate::error::{ErrorPolicy, SealTunError};
use crate::session::PeerRegistry;
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::stats::TrafficStats;
use crate::transport::{ClientTransport, ServerTransport};
use crate::tunnel::PacketInterface;

/// Transport receive timeout; bounds how long shutdown can go unnoticed
pub const INGRESS_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffer size for packets
pub const BUFFER_SIZE: usize = 1 << 16;

/// Pause after a failed TUN read before trying again
const TUN_READ_BACKOFF: Duration = Duration::from_millis(10);

/// Everything a pump shares with its sibling and the lifecycle owner
#[derive(Clone)]
pub struct PumpContext {
    pub codec: Arc<SealCodec>,
    pub interface: Arc<dyn PacketInterface>,
    pub stats: Arc<TrafficStats>,
    pub shutdown: Shutdown,
}

impl PumpContext {
    /// Apply the error policy. `Break` means the pump must exit.
    fn on_error(
        &self,
        pump: &str,
        peer: Option<SocketAddr>,
        err: impl Into<SealTunError>,
    ) -> ControlFlow<()> {
        let err = err.into();

        match err.policy() {
            ErrorPolicy::LogAndContinue => {
                match (&err, peer) {
                    (SealTunError::Crypto(_), Some(peer)) => {
                        self.stats.record_dropped();
                        tracing::trace!("{}: dropping datagram from {}: {}", pump, peer, err);
                    }
                    (SealTunError::Crypto(_), None) => {
                        self.stats.record_dropped();
                        tracing::trace!("{}: dropping packet: {}", pump, err);
                    }
                    (_, Some(peer)) => {
                        self.stats.record_io_error();
                        tracing::warn!("{}: {} ({})", pump, err, peer);
                    }
                    (_, None) => {
                        self.stats.record_io_error();
                        tracing::warn!("{}: {}", pump, err);
                    }
                }
                ControlFlow::Continue(())
            }
            ErrorPolicy::Abort => {
                tracing::error!("{} pump stopping: {}", pump, err);
                self.shutdown.trigger();
                ControlFlow::Break(())
            }
        }
    }

    /// Next packet from the interface, or `None` when the pump must exit
    async fn read_next(
        &self,
        pump: &str,
        shutdown: &mut ShutdownListener,
        buf: &mut [u8],
    ) -> Option<usize> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }

            let result = tokio::select! {
                _ = shutdown.wait() => return None,
                result = self.interface.read_packet(buf) => result,
            };

            match result {
                Ok(len) => return Some(len),
                Err(e) => {
                    if self.on_error(pump, None, e).is_break() {
                        return None;
                    }
                    tokio::select! {
                        _ = shutdown.wait() => return None,
                        _ = sleep(TUN_READ_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Write an opened packet to the interface
    async fn deliver(&self, pump: &str, packet: &[u8]) -> ControlFlow<()> {
        if packet.is_empty() {
            tracing::trace!("{}: empty packet, nothing to write", pump);
            return ControlFlow::Continue(());
        }

        match self.interface.write_packet(packet).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => self.on_error(pump, None, e),
        }
    }
}

/// Client egress: TUN -> seal -> server
pub async fn client_egress(ctx: PumpContext, link: Arc<dyn ClientTransport>) {
    const PUMP: &str = "egress";

    let mut shutdown = ctx.shutdown.subscribe();
    let mut buf = vec![0u8; BUFFER_SIZE];

    tracing::debug!("Egress pump started ({} -> {})", ctx.interface.name(), link.remote());

    while let Some(len) = ctx.read_next(PUMP, &mut shutdown, &mut buf).await {
        let frame = match ctx.codec.seal(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                if ctx.on_error(PUMP, None, e).is_break() {
                    break;
                }
                continue;
            }
        };

        match link.send(&frame).await {
            Ok(()) => ctx.stats.record_sent(frame.len()),
            Err(e) => {
                if ctx.on_error(PUMP, Some(link.remote()), e).is_break() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Egress pump stopped");
}

/// Client ingress: server -> open -> TUN
pub async fn client_ingress(ctx: PumpContext, link: Arc<dyn ClientTransport>) {
    const PUMP: &str = "ingress";

    let mut shutdown = ctx.shutdown.subscribe();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let remote = link.remote();

    tracing::debug!("Ingress pump started ({} -> {})", remote, ctx.interface.name());

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown.wait() => break,
            received = link.recv(&mut buf, INGRESS_POLL_TIMEOUT) => received,
        };

        let len = match received {
            Ok(Some(len)) => len,
            Ok(None) => continue,
            Err(e) => {
                if ctx.on_error(PUMP, Some(remote), e).is_break() {
                    break;
                }
                continue;
            }
        };

        let packet = match ctx.codec.open(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                if ctx.on_error(PUMP, Some(remote), e).is_break() {
                    break;
                }
                continue;
            }
        };
        ctx.stats.record_received(len);

        if ctx.deliver(PUMP, &packet).await.is_break() {
            break;
        }
    }

    tracing::debug!("Ingress pump stopped");
}

/// Server egress: TUN -> seal -> every active peer
///
/// Fan-out is a broadcast: each peer in the snapshot gets its own
/// independently sealed copy of every packet.
pub async fn server_egress(
    ctx: PumpContext,
    socket: Arc<dyn ServerTransport>,
    registry: Arc<PeerRegistry>,
) {
    const PUMP: &str = "egress";

    let mut shutdown = ctx.shutdown.subscribe();
    let mut buf = vec![0u8; BUFFER_SIZE];

    tracing::debug!("Egress pump started ({} -> peers)", ctx.interface.name());

    'pump: while let Some(len) = ctx.read_next(PUMP, &mut shutdown, &mut buf).await {
        let packet = &buf[..len];

        let peers = registry.snapshot().await;
        if peers.is_empty() {
            tracing::trace!("No active peers, dropping {} byte packet", len);
            continue;
        }

        for peer in peers {
            let frame = match ctx.codec.seal(packet) {
                Ok(frame) => frame,
                Err(e) => {
                    if ctx.on_error(PUMP, Some(peer), e).is_break() {
                        break 'pump;
                    }
                    continue;
                }
            };

            match socket.send_to(peer, &frame).await {
                Ok(()) => {
                    ctx.stats.record_sent(frame.len());
                    registry.record_sent(peer).await;
                }
                Err(e) => {
                    if ctx.on_error(PUMP, Some(peer), e).is_break() {
                        break 'pump;
                    }
                }
            }
        }
    }

    tracing::debug!("Egress pump stopped");
}

/// Server ingress: any peer -> open -> registry touch -> TUN
///
/// Only datagrams that open successfully touch the registry, so every
/// registered peer has proven it holds the key.
pub async fn server_ingress(
    ctx: PumpContext,
    socket: Arc<dyn ServerTransport>,
    registry: Arc<PeerRegistry>,
) {
    const PUMP: &str = "ingress";

    let mut shutdown = ctx.shutdown.subscribe();
    let mut buf = vec![0u8; BUFFER_SIZE];

    tracing::debug!("Ingress pump started ({} -> {})", socket.local_addr(), ctx.interface.name());

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown.wait() => break,
            received = socket.recv_from(&mut buf, INGRESS_POLL_TIMEOUT) => received,
        };

        let (len, from) = match received {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(e) => {
                if ctx.on_error(PUMP, None, e).is_break() {
                    break;
                }
                continue;
            }
        };

        let packet = match ctx.codec.open(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                if ctx.on_error(PUMP, Some(from), e).is_break() {
                    break;
                }
                continue;
            }
        };

        registry.touch(from).await;
        ctx.stats.record_received(len);

        if ctx.deliver(PUMP, &packet).await.is_break() {
            break;
        }
    }

    tracing::debug!("Ingress pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::{KEY_LEN, NONCE_LEN};
    use crate::testing::{MockInterface, MockLink, MockSocket};
    use std::collections::HashSet;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn context(interface: Arc<MockInterface>) -> PumpContext {
        PumpContext {
            codec: Arc::new(SealCodec::new(&[3u8; KEY_LEN]).unwrap()),
            interface,
            stats: Arc::new(TrafficStats::new()),
            shutdown: Shutdown::new(),
        }
    }

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 9], port))
    }

    #[tokio::test]
    async fn test_client_egress_seals_in_order() {
        let interface = Arc::new(MockInterface::new("tun-test"));
        let (link, mut remote) = MockLink::pair();
        let ctx = context(interface.clone());
        let codec = ctx.codec.clone();
        let shutdown = ctx.shutdown.clone();

        let pump = tokio::spawn(client_egress(ctx, link));

        interface.inject(b"first".to_vec());
        interface.inject(b"second".to_vec());

        let a = timeout(WAIT, remote.sent.recv()).await.unwrap().unwrap();
        let b = timeout(WAIT, remote.sent.recv()).await.unwrap().unwrap();
        assert_eq!(codec.open(&a).unwrap(), b"first");
        assert_eq!(codec.open(&b).unwrap(), b"second");

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_ingress_drops_bad_frames_and_continues() {
        let interface = Arc::new(MockInterface::new("tun-test"));
        let (link, remote) = MockLink::pair();
        let ctx = context(interface.clone());
        let codec = ctx.codec.clone();
        let stats = ctx.stats.clone();
        let shutdown = ctx.shutdown.clone();

        let pump = tokio::spawn(client_ingress(ctx, link));

        // Too short, then forged, then genuine
        remote.deliver(vec![1, 2, 3]);
        remote.deliver(vec![0u8; NONCE_LEN + 40]);
        let mut tampered = codec.seal(b"evil").unwrap();
        tampered[NONCE_LEN] ^= 0xff;
        remote.deliver(tampered);
        remote.deliver(codec.seal(b"genuine").unwrap());

        let written = timeout(WAIT, interface.next_written()).await.unwrap();
        assert_eq!(written, b"genuine");
        assert_eq!(stats.snapshot().frames_dropped, 3);
        assert_eq!(stats.snapshot().packets_received, 1);

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_packets_are_not_written() {
        let interface = Arc::new(MockInterface::new("tun-srv"));
        let (socket, wire) = MockSocket::new(endpoint(51820));
        let registry = Arc::new(PeerRegistry::new());
        let ctx = context(interface.clone());
        let codec = ctx.codec.clone();
        let stats = ctx.stats.clone();
        let shutdown = ctx.shutdown.clone();

        let pump = tokio::spawn(server_ingress(ctx, socket, registry.clone()));

        let a = endpoint(40001);
        wire.deliver(a, codec.seal(b"").unwrap());
        wire.deliver(a, codec.seal(b"next").unwrap());

        let written = timeout(WAIT, interface.next_written()).await.unwrap();
        assert_eq!(written, b"next");

        // The empty frame was authentic, so it still counts and registers
        assert_eq!(stats.snapshot().packets_received, 2);
        assert_eq!(stats.snapshot().frames_dropped, 0);
        assert_eq!(registry.get(a).await.unwrap().packets_received, 2);

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transient_interface_errors_do_not_stop_egress() {
        let interface = Arc::new(MockInterface::new("tun-test"));
        let (link, mut remote) = MockLink::pair();
        let ctx = context(interface.clone());
        let stats = ctx.stats.clone();
        let shutdown = ctx.shutdown.clone();

        interface.fail_next_reads(2);
        let pump = tokio::spawn(client_egress(ctx, link));
        interface.inject(b"after hiccup".to_vec());

        timeout(WAIT, remote.sent.recv()).await.unwrap().unwrap();
        assert_eq!(stats.snapshot().io_errors, 2);

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_is_logged_and_skipped() {
        let interface = Arc::new(MockInterface::new("tun-test"));
        let (link, mut remote) = MockLink::pair();
        let ctx = context(interface.clone());
        let codec = ctx.codec.clone();
        let stats = ctx.stats.clone();
        let shutdown = ctx.shutdown.clone();

        link.fail_next_sends(1);
        let pump = tokio::spawn(client_egress(ctx, link));
        interface.inject(b"lost".to_vec());
        interface.inject(b"kept".to_vec());

        let frame = timeout(WAIT, remote.sent.recv()).await.unwrap().unwrap();
        assert_eq!(codec.open(&frame).unwrap(), b"kept");
        assert_eq!(stats.snapshot().io_errors, 1);
        assert_eq!(stats.snapshot().packets_sent, 1);

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_interface_aborts_tunnel() {
        let interface = Arc::new(MockInterface::new("tun-test"));
        let (link, _remote) = MockLink::pair();
        let ctx = context(interface.clone());
        let shutdown = ctx.shutdown.clone();

        interface.close().await;
        let pump = tokio::spawn(client_egress(ctx, link));

        timeout(WAIT, pump).await.unwrap().unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_server_ingress_registers_only_authentic_senders() {
        let interface = Arc::new(MockInterface::new("tun-srv"));
        let (socket, wire) = MockSocket::new(endpoint(51820));
        let registry = Arc::new(PeerRegistry::new());
        let ctx = context(interface.clone());
        let codec = ctx.codec.clone();
        let shutdown = ctx.shutdown.clone();

        let pump = tokio::spawn(server_ingress(ctx, socket, registry.clone()));

        let (a, forger) = (endpoint(40001), endpoint(40002));
        wire.deliver(forger, vec![9u8; 64]);
        wire.deliver(a, codec.seal(b"hello from a").unwrap());

        let written = timeout(WAIT, interface.next_written()).await.unwrap();
        assert_eq!(written, b"hello from a");
        assert_eq!(registry.snapshot().await, vec![a]);
        assert!(!registry.contains(forger).await);

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_egress_fans_out_to_every_peer() {
        let interface = Arc::new(MockInterface::new("tun-srv"));
        let (socket, mut wire) = MockSocket::new(endpoint(51820));
        let registry = Arc::new(PeerRegistry::new());
        let ctx = context(interface.clone());
        let codec = ctx.codec.clone();
        let shutdown = ctx.shutdown.clone();

        let (a, b) = (endpoint(40001), endpoint(40002));
        registry.touch(a).await;
        registry.touch(b).await;

        let pump = tokio::spawn(server_egress(ctx, socket, registry.clone()));
        interface.inject(b"broadcast me".to_vec());

        let first = timeout(WAIT, wire.sent.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, wire.sent.recv()).await.unwrap().unwrap();

        let targets: HashSet<_> = [first.0, second.0].into_iter().collect();
        assert_eq!(targets, HashSet::from([a, b]));
        assert_eq!(codec.open(&first.1).unwrap(), b"broadcast me");
        assert_eq!(codec.open(&second.1).unwrap(), b"broadcast me");
        assert_ne!(first.1[..NONCE_LEN], second.1[..NONCE_LEN]);

        // Exactly one send per peer
        assert!(timeout(Duration::from_millis(100), wire.sent.recv()).await.is_err());
        assert_eq!(registry.get(a).await.unwrap().packets_sent, 1);
        assert_eq!(registry.get(b).await.unwrap().packets_sent, 1);

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_egress_without_peers_sends_nothing() {
        let interface = Arc::new(MockInterface::new("tun-srv"));
        let (socket, mut wire) = MockSocket::new(endpoint(51820));
        let registry = Arc::new(PeerRegistry::new());
        let ctx = context(interface.clone());
        let shutdown = ctx.shutdown.clone();

        let pump = tokio::spawn(server_egress(ctx, socket, registry));
        interface.inject(b"nobody home".to_vec());

        assert!(timeout(Duration::from_millis(100), wire.sent.recv()).await.is_err());

        shutdown.trigger();
        timeout(WAIT, pump).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pumps_exit_promptly_while_blocked() {
        let interface = Arc::new(MockInterface::new("tun-test"));
        let (link, _remote) = MockLink::pair();
        let ctx = context(interface.clone());
        let shutdown = ctx.shutdown.clone();

        let egress = tokio::spawn(client_egress(ctx.clone(), link.clone()));
        let ingress = tokio::spawn(client_ingress(ctx, link));
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.trigger();
        timeout(INGRESS_POLL_TIMEOUT, egress).await.unwrap().unwrap();
        timeout(INGRESS_POLL_TIMEOUT, ingress).await.unwrap().unwrap();
    }
}
