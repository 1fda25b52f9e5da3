//! Client connection supervisor
//!
//! Owns the single datagram association to the server:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected -> (Connecting | Terminated)
//! ```
//!
//! Connection attempts are bounded by a per-attempt timeout and a fixed
//! attempt ceiling with a fixed delay between attempts. Transport errors
//! while connected do not change state; UDP has no session to lose.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use crate::error::NetworkError;
use crate::shutdown::ShutdownListener;
use crate::transport::{ClientTransport, Connector};

/// Give up after this many connection attempts
pub const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Delay between connection attempts
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Timeout for a single connection attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection establishment policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            attempt_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Lifecycle state of the client association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport held yet
    Idle,
    /// Attempting to establish the association
    Connecting,
    /// Transport is valid and usable by the pumps
    Connected,
    /// Released after an explicit disconnect; may connect again
    Disconnected,
    /// Gave up or cancelled; no further use
    Terminated,
}

/// Establishes and owns the connection to one fixed remote endpoint
pub struct ConnectionSupervisor {
    endpoint: String,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    state: ConnectionState,
    transport: Option<Arc<dyn ClientTransport>>,
    attempts: u32,
}

impl ConnectionSupervisor {
    pub fn new(endpoint: impl Into<String>, connector: Arc<dyn Connector>, policy: RetryPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            policy,
            state: ConnectionState::Idle,
            transport: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Attempts made by the most recent `connect` call
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The live transport, if connected
    pub fn transport(&self) -> Option<Arc<dyn ClientTransport>> {
        self.transport.clone()
    }

    /// Establish the association, retrying per the policy
    ///
    /// Every wait (attempt, retry delay) is raced against `shutdown`; a
    /// shutdown request terminates the supervisor with
    /// [`NetworkError::Cancelled`].
    pub async fn connect(
        &mut self,
        shutdown: &mut ShutdownListener,
    ) -> Result<Arc<dyn ClientTransport>, NetworkError> {
        match self.state {
            ConnectionState::Connected => {
                if let Some(transport) = &self.transport {
                    return Ok(Arc::clone(transport));
                }
            }
            ConnectionState::Terminated => return Err(NetworkError::Closed),
            _ => {}
        }

        self.state = ConnectionState::Connecting;
        self.attempts = 0;
        let mut last_error = String::from("no attempt made");

        while self.attempts < self.policy.max_attempts {
            if shutdown.is_triggered() {
                return Err(self.cancel());
            }

            self.attempts += 1;
            tracing::info!(
                "Connection attempt {}/{} to {}...",
                self.attempts,
                self.policy.max_attempts,
                self.endpoint
            );

            let connector = Arc::clone(&self.connector);
            let endpoint = self.endpoint.clone();
            let attempt = timeout(self.policy.attempt_timeout, async move {
                connector.connect(&endpoint).await
            });
            let result = tokio::select! {
                _ = shutdown.wait() => return Err(self.cancel()),
                result = attempt => result,
            };

            match result {
                Ok(Ok(transport)) => {
                    tracing::info!("Connected to {} ({})", self.endpoint, transport.remote());
                    self.state = ConnectionState::Connected;
                    self.transport = Some(Arc::clone(&transport));
                    return Ok(transport);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Connection attempt {} failed: {}", self.attempts, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    let e = NetworkError::ConnectTimeout {
                        endpoint: self.endpoint.clone(),
                        seconds: self.policy.attempt_timeout.as_secs(),
                    };
                    tracing::warn!("Connection attempt {} failed: {}", self.attempts, e);
                    last_error = e.to_string();
                }
            }

            if self.attempts < self.policy.max_attempts {
                tracing::info!("Retrying in {:?}...", self.policy.retry_delay);
                tokio::select! {
                    _ = shutdown.wait() => return Err(self.cancel()),
                    _ = sleep(self.policy.retry_delay) => {}
                }
            }
        }

        self.state = ConnectionState::Terminated;
        Err(NetworkError::RetriesExhausted {
            endpoint: self.endpoint.clone(),
            attempts: self.attempts,
            reason: last_error,
        })
    }

    /// Release the transport
    ///
    /// A live connection moves to `Disconnected`; anything that never
    /// connected moves to `Terminated`. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }

        self.state = match self.state {
            ConnectionState::Connected | ConnectionState::Disconnected => {
                ConnectionState::Disconnected
            }
            _ => ConnectionState::Terminated,
        };
    }

    fn cancel(&mut self) -> NetworkError {
        tracing::info!("Connection to {} cancelled by shutdown", self.endpoint);
        self.state = ConnectionState::Terminated;
        NetworkError::Cancelled
    }
}
