//! Server-side peer registry
//!
//! A peer is any endpoint that has sent at least one datagram that opened
//! successfully. Peers idle for longer than the timeout are evicted; one
//! that comes back afterwards is treated as new.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::shutdown::ShutdownListener;

/// Evict peers idle for longer than this
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often the eviction sweep runs
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// A remote endpoint considered connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub endpoint: SocketAddr,
    /// When the first authentic datagram arrived
    pub joined_at: Instant,
    /// When the latest authentic datagram arrived
    pub last_seen: Instant,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl Peer {
    fn new(endpoint: SocketAddr, now: Instant) -> Self {
        Self {
            endpoint,
            joined_at: now,
            last_seen: now,
            packets_sent: 0,
            packets_received: 0,
        }
    }

    /// Idle for strictly longer than `timeout` as of `now`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Result of [`PeerRegistry::touch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// Endpoint was unknown and is now active
    Joined,
    /// Endpoint was already active
    Refreshed,
}

/// Endpoint-keyed map of active peers
///
/// Shared by the ingress pump (touch), the egress pump (snapshot, sent
/// counters) and the eviction task. The lock is only held for map access,
/// never across network I/O.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<SocketAddr, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authentic datagram from `endpoint`
    pub async fn touch(&self, endpoint: SocketAddr) -> TouchOutcome {
        self.touch_at(endpoint, Instant::now()).await
    }

    /// [`touch`](Self::touch) with an explicit clock reading
    pub async fn touch_at(&self, endpoint: SocketAddr, now: Instant) -> TouchOutcome {
        let mut peers = self.peers.write().await;

        let mut outcome = TouchOutcome::Refreshed;
        let peer = peers.entry(endpoint).or_insert_with(|| {
            outcome = TouchOutcome::Joined;
            Peer::new(endpoint, now)
        });
        peer.last_seen = now;
        peer.packets_received += 1;

        if outcome == TouchOutcome::Joined {
            tracing::info!("Peer joined: {} ({} active)", endpoint, peers.len());
        }

        outcome
    }

    /// Point-in-time list of active endpoints for fan-out
    pub async fn snapshot(&self) -> Vec<SocketAddr> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Count a frame successfully sent to `endpoint`
    ///
    /// No-op if the peer was evicted since the snapshot was taken.
    pub async fn record_sent(&self, endpoint: SocketAddr) {
        if let Some(peer) = self.peers.write().await.get_mut(&endpoint) {
            peer.packets_sent += 1;
        }
    }

    /// Remove every peer idle for longer than `timeout`, returning them
    pub async fn evict(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let mut peers = self.peers.write().await;

        let mut evicted = Vec::new();
        peers.retain(|endpoint, peer| {
            if peer.is_stale(now, timeout) {
                evicted.push(*endpoint);
                false
            } else {
                true
            }
        });

        for endpoint in &evicted {
            tracing::info!("Removing stale peer: {}", endpoint);
        }

        evicted
    }

    /// Copy of every peer record
    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn get(&self, endpoint: SocketAddr) -> Option<Peer> {
        self.peers.read().await.get(&endpoint).cloned()
    }

    pub async fn contains(&self, endpoint: SocketAddr) -> bool {
        self.peers.read().await.contains_key(&endpoint)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

/// Periodic eviction sweep, runs until shutdown
pub async fn run_eviction(
    registry: Arc<PeerRegistry>,
    period: Duration,
    timeout: Duration,
    mut shutdown: ShutdownListener,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let evicted = registry.evict(Instant::now(), timeout).await;
                if !evicted.is_empty() {
                    tracing::debug!("Eviction sweep removed {} peer(s)", evicted.len());
                }
            }
        }
    }

    tracing::debug!("Eviction task stopped");
}
