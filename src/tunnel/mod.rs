//! TUN device abstraction layer
//!
//! The forwarding engine only sees [`PacketInterface`]. The real
//! implementation wraps a tun-rs async device; tests plug in channel-backed
//! fakes.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::config::InterfaceConfig;
use crate::error::TunnelError;

/// Local virtual network interface carrying raw IP packets
///
/// `read_packet` and `write_packet` may run concurrently from different
/// tasks.
#[async_trait]
pub trait PacketInterface: Send + Sync {
    /// Interface name (e.g. "tun0", "utun5")
    fn name(&self) -> &str;

    /// Read one packet into `buf`, returning its length
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    /// Write one packet
    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError>;

    /// Stop accepting I/O. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Acquires the interface during startup
#[async_trait]
pub trait InterfaceFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn PacketInterface>, TunnelError>;
}

/// Async TUN device wrapper
pub struct TunDevice {
    /// The underlying async TUN device
    device: AsyncDevice,
    /// Device name (e.g., "utun5", "tun0")
    name: String,
    closed: AtomicBool,
}

impl TunDevice {
    /// Create a new TUN device with the given configuration
    pub async fn create(
        name: Option<&str>,
        address: Ipv4Net,
        mtu: u16,
    ) -> Result<Self, TunnelError> {
        // Check for required privileges first
        check_privileges()?;

        let mut builder = DeviceBuilder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }

        let device = builder
            .ipv4(address.addr(), address.prefix_len(), None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device
            .deref()
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("Failed to get device name: {}", e),
            })?;

        tracing::info!("Created TUN device: {} with address {}", name, address);

        Ok(Self {
            device,
            name,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PacketInterface for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.device
            .recv(buf)
            .await
            .map_err(|e| TunnelError::ReadFailed {
                reason: e.to_string(),
            })
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.device
            .send(packet)
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::WriteFailed {
                reason: e.to_string(),
            })
    }

    // The descriptor itself is released when the last handle drops
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("TUN device {} closed", self.name);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opens a [`TunDevice`] from the `[Interface]` config section
#[derive(Debug, Clone)]
pub struct TunFactory {
    name: Option<String>,
    address: Ipv4Net,
    mtu: u16,
}

impl TunFactory {
    pub fn new(config: &InterfaceConfig) -> Self {
        Self {
            name: config.name.clone(),
            address: config.address,
            mtu: config.mtu,
        }
    }
}

#[async_trait]
impl InterfaceFactory for TunFactory {
    async fn open(&self) -> Result<Arc<dyn PacketInterface>, TunnelError> {
        let device = TunDevice::create(self.name.as_deref(), self.address, self.mtu).await?;
        Ok(Arc::new(device))
    }
}

/// Check for required privileges to create TUN devices
fn check_privileges() -> Result<(), TunnelError> {
    #[cfg(unix)]
    {
        // On Unix, we need root or CAP_NET_ADMIN
        if unsafe { libc::geteuid() } != 0 {
            #[cfg(target_os = "linux")]
            {
                // CAP_NET_ADMIN may still be granted; let creation report the failure
                tracing::warn!("Running without root. TUN creation may fail.");
                tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN:");
                tracing::warn!("  sudo setcap cap_net_admin=eip ./sealtun");
            }

            #[cfg(target_os = "macos")]
            {
                return Err(TunnelError::InsufficientPrivileges {
                    message: "Root privileges required on macOS. Run with sudo.".to_string(),
                });
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        if !is_elevated_windows() {
            return Err(TunnelError::InsufficientPrivileges {
                message: "Administrator privileges required on Windows.".to_string(),
            });
        }
    }

    Ok(())
}

/// Check if running as Administrator on Windows
#[cfg(target_os = "windows")]
fn is_elevated_windows() -> bool {
    use std::mem::MaybeUninit;
    use std::ptr::null_mut;

    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{GetCurrentProcess, OpenProcessToken};
    use winapi::um::securitybaseapi::GetTokenInformation;
    use winapi::um::winnt::{TokenElevation, HANDLE, TOKEN_ELEVATION, TOKEN_QUERY};

    unsafe {
        let mut token: HANDLE = null_mut();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation: MaybeUninit<TOKEN_ELEVATION> = MaybeUninit::uninit();
        let mut size: u32 = std::mem::size_of::<TOKEN_ELEVATION>() as u32;

        let result = GetTokenInformation(
            token,
            TokenElevation,
            elevation.as_mut_ptr() as *mut _,
            size,
            &mut size,
        );

        CloseHandle(token);

        if result == 0 {
            return false;
        }

        elevation.assume_init().TokenIsElevated != 0
    }
}
