//! sealtun - pre-shared-key UDP tunnel
//!
//! Moves raw IP packets between a local TUN device and remote peers, each
//! packet sealed with ChaCha20-Poly1305 under a shared 32-byte key.
//!
//! # Features
//!
//! - Client and server roles over plain UDP
//! - Random 96-bit nonce per packet, frames are `nonce || ciphertext || tag`
//! - Server peer registry with idle eviction and broadcast fan-out
//! - Bounded connection retries on the client
//! - Ordered startup and idempotent, fully joined shutdown
//!
//! # Usage
//!
//! ```no_run
//! use sealtun::{TunnelClient, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> sealtun::error::Result<()> {
//!     let config = TunnelConfig::from_file("sealtun.conf")?;
//!     let mut client = TunnelClient::new(config);
//!     client.start().await?;
//!     client.closed().await;
//!     client.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod forward;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stats;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use client::TunnelClient;
pub use config::{Mode, TunnelConfig};
pub use crypto::SealCodec;
pub use error::SealTunError;
pub use server::TunnelServer;
pub use shutdown::Shutdown;
