//! Error types for the sealtun tunnel
//!
//! Errors fall into two classes: setup failures that abort startup, and
//! transient per-packet failures that are logged while the pumps keep
//! running. [`SealTunError::policy`] is the single place that decides which.

use thiserror::Error;

/// Main error type for sealtun
#[derive(Error, Debug)]
pub enum SealTunError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel device errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// `start` called on a tunnel that was already started
    #[error("Tunnel already started")]
    AlreadyStarted,

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid base64 key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid address for {field}: {value}")]
    InvalidAddress { field: String, value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sealed frame errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Malformed frame: {len} bytes, need at least {min}")]
    MalformedFrame { len: usize, min: usize },

    #[error("Authentication failed: invalid ciphertext or authentication tag")]
    AuthenticationFailed,

    #[error("Encryption failed")]
    Encryption,

    #[error("Secure random source unavailable: {reason}")]
    Randomness { reason: String },
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    #[error("Connect to {endpoint} timed out after {seconds}s")]
    ConnectTimeout { endpoint: String, seconds: u64 },

    #[error("Failed to connect to {endpoint} after {attempts} attempts: {reason}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Transport closed")]
    Closed,

    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("TUN device closed")]
    Closed,

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },
}

/// What a running pump does with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Record it, drop the packet, keep forwarding
    LogAndContinue,
    /// Stop the tunnel
    Abort,
}

impl SealTunError {
    /// Map each error kind to its handling policy
    pub fn policy(&self) -> ErrorPolicy {
        use ErrorPolicy::*;

        match self {
            Self::Crypto(CryptoError::MalformedFrame { .. })
            | Self::Crypto(CryptoError::AuthenticationFailed)
            | Self::Crypto(CryptoError::Encryption) => LogAndContinue,
            Self::Crypto(CryptoError::Randomness { .. })
            | Self::Crypto(CryptoError::InvalidKeyLength { .. }) => Abort,

            Self::Tunnel(TunnelError::ReadFailed { .. })
            | Self::Tunnel(TunnelError::WriteFailed { .. }) => LogAndContinue,
            Self::Tunnel(_) => Abort,

            Self::Network(NetworkError::SendFailed { .. })
            | Self::Network(NetworkError::ReceiveFailed { .. })
            | Self::Network(NetworkError::Io(_)) => LogAndContinue,
            Self::Network(_) => Abort,

            Self::Config(_) | Self::AlreadyStarted | Self::System(_) => Abort,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        self.policy() == ErrorPolicy::LogAndContinue
    }

    /// Shutdown requested while still setting up
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Network(NetworkError::Cancelled))
    }

    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => {
                #[cfg(target_os = "linux")]
                return "Insufficient privileges. Run with sudo or grant CAP_NET_ADMIN:\n  \
                        sudo setcap cap_net_admin=eip ./sealtun"
                    .to_string();
                #[cfg(target_os = "macos")]
                return "Insufficient privileges. Run with sudo:\n  \
                        sudo ./sealtun -c sealtun.conf"
                    .to_string();
                #[cfg(target_os = "windows")]
                return "Insufficient privileges. Run as Administrator.".to_string();
                #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
                return format!("{}", self);
            }

            Self::Config(ConfigError::FileNotFound { path }) => {
                format!(
                    "Config file not found: {}\n  Check the path and try again.",
                    path
                )
            }

            Self::Config(ConfigError::InvalidKey { field }) => {
                format!(
                    "Invalid {} in config. Expected 32-byte base64-encoded key \
                     (generate one with `sealtun --genkey`).",
                    field
                )
            }

            Self::Network(NetworkError::RetriesExhausted {
                endpoint, attempts, ..
            }) => {
                format!(
                    "Could not reach {} after {} attempts.\n  \
                    Check that the server is running and UDP traffic is allowed.",
                    endpoint, attempts
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => 2,
            Self::Network(_) => 3,
            Self::Crypto(_) => 5,
            Self::Tunnel(_) => 6,
            _ => 255,
        }
    }
}

/// Result type alias for sealtun operations
pub type Result<T> = std::result::Result<T, SealTunError>;
