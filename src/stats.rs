//! Traffic counters and the periodic report task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use crate::session::PeerRegistry;
use crate::shutdown::ShutdownListener;

/// How often traffic counters are logged
pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Tunnel-wide counters, shared by both pumps
#[derive(Debug, Default)]
pub struct TrafficStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    frames_dropped: AtomicU64,
    io_errors: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub frames_dropped: u64,
    pub io_errors: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sealed frame of `bytes` left on the transport
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// An authentic frame of `bytes` arrived on the transport
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A datagram failed to open and was discarded
    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Log counters every `period` until shutdown
///
/// The server passes its registry to include the active peer count.
pub async fn run_reporter(
    stats: Arc<TrafficStats>,
    registry: Option<Arc<PeerRegistry>>,
    period: Duration,
    mut shutdown: ShutdownListener,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let s = stats.snapshot();
                let peers = match &registry {
                    Some(registry) => Some(registry.peers().await),
                    None => None,
                };
                match &peers {
                    Some(peers) => tracing::info!(
                        "Traffic: sent {} pkts ({} B), received {} pkts ({} B), dropped {}, io errors {}, peers {}",
                        s.packets_sent, s.bytes_sent, s.packets_received, s.bytes_received,
                        s.frames_dropped, s.io_errors, peers.len()
                    ),
                    None => tracing::info!(
                        "Traffic: sent {} pkts ({} B), received {} pkts ({} B), dropped {}, io errors {}",
                        s.packets_sent, s.bytes_sent, s.packets_received, s.bytes_received,
                        s.frames_dropped, s.io_errors
                    ),
                }
                for peer in peers.iter().flatten() {
                    tracing::debug!(
                        "  {}: sent {}, received {}, idle {:?}",
                        peer.endpoint,
                        peer.packets_sent,
                        peer.packets_received,
                        peer.last_seen.elapsed()
                    );
                }
            }
        }
    }
}
