//! sealtun configuration file parser
//!
//! Parses `.conf` files with [Interface] and [Tunnel] sections.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::{IpNet, Ipv4Net};

use crate::error::ConfigError;
use crate::session::registry::PEER_TIMEOUT;
use crate::session::supervisor::{CONNECT_TIMEOUT, MAX_CONNECT_ATTEMPTS, RETRY_DELAY};
use crate::session::RetryPolicy;

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1420;

/// Directory searched when no config path is given
pub const DEFAULT_CONFIG_DIR: &str = "configs";

/// File looked up inside [`DEFAULT_CONFIG_DIR`]
pub const DEFAULT_CONFIG_FILE: &str = "sealtun.conf";

/// Complete tunnel configuration
#[derive(Clone)]
pub struct TunnelConfig {
    /// Local virtual interface
    pub interface: InterfaceConfig,
    /// Role, remote endpoint and key
    pub tunnel: TunnelSettings,
}

/// Interface (local) configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Requested adapter name; the OS picks one if absent
    pub name: Option<String>,
    /// Our tunnel IP address with prefix
    pub address: Ipv4Net,
    pub mtu: u16,
}

/// Which side of the tunnel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Mode::Client),
            "server" => Ok(Mode::Server),
            _ => Err(ConfigError::InvalidValue {
                field: "Mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// [Tunnel] section
#[derive(Clone)]
pub struct TunnelSettings {
    pub mode: Mode,
    /// Client: remote `host:port`. Server: local bind `ip:port`.
    pub server_address: String,
    /// Shared AEAD key
    pub preshared_key: [u8; 32],
    /// Server: evict peers idle for longer than this
    pub peer_timeout: Duration,
    /// Client: connection attempt ceiling
    pub connect_attempts: u32,
    /// Client: pause between attempts
    pub retry_delay: Duration,
    /// Client: bound on a single attempt
    pub connect_timeout: Duration,
}

impl fmt::Debug for TunnelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSettings")
            .field("mode", &self.mode)
            .field("server_address", &self.server_address)
            .field("preshared_key", &"<redacted>")
            .field("peer_timeout", &self.peer_timeout)
            .field("connect_attempts", &self.connect_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("interface", &self.interface)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode={} server={} interface={} address={} mtu={} key=<redacted>",
            self.tunnel.mode,
            self.tunnel.server_address,
            self.interface.name.as_deref().unwrap_or("<auto>"),
            self.interface.address,
            self.interface.mtu
        )
    }
}

impl TunnelConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::default();
        let mut current_section: Option<Section> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = strip_comment(line).trim();

            if line.is_empty() {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                current_section = Some(Section::Interface);
                continue;
            } else if line.eq_ignore_ascii_case("[tunnel]") {
                current_section = Some(Section::Tunnel);
                continue;
            } else if line.starts_with('[') {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Unknown section: {}", line),
                });
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Interface) => match key.as_str() {
                    "name" => {
                        if !value.is_empty() {
                            raw.name = Some(value.to_string());
                        }
                    }
                    "address" => {
                        let ip_net: IpNet = value.parse().map_err(|_| ConfigError::InvalidCidr {
                            value: value.to_string(),
                        })?;
                        let IpNet::V4(v4net) = ip_net else {
                            return Err(ConfigError::InvalidCidr {
                                value: value.to_string(),
                            });
                        };
                        raw.address = Some(v4net);
                    }
                    "mtu" => {
                        raw.mtu = Some(parse_number(value, "MTU", line_num)?);
                    }
                    _ => {
                        // Unknown key, ignore (forward compatibility)
                        tracing::debug!("Unknown interface key: {}", key);
                    }
                },
                Some(Section::Tunnel) => match key.as_str() {
                    "mode" => raw.mode = Some(value.parse()?),
                    "serveraddress" => raw.server_address = Some(value.to_string()),
                    "presharedkey" => raw.preshared_key = Some(parse_key(value, "PreSharedKey")?),
                    "peertimeout" => {
                        raw.peer_timeout = Some(parse_number(value, "PeerTimeout", line_num)?);
                    }
                    "connectattempts" => {
                        raw.connect_attempts =
                            Some(parse_number(value, "ConnectAttempts", line_num)?);
                    }
                    "retrydelay" => {
                        raw.retry_delay = Some(parse_number(value, "RetryDelay", line_num)?);
                    }
                    "connecttimeout" => {
                        raw.connect_timeout =
                            Some(parse_number(value, "ConnectTimeout", line_num)?);
                    }
                    _ => {
                        tracing::debug!("Unknown tunnel key: {}", key);
                    }
                },
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        let config = raw.build()?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the configured mode and re-validate
    pub fn with_mode(mut self, mode: Mode) -> Result<Self, ConfigError> {
        self.tunnel.mode = mode;
        self.validate()?;
        Ok(self)
    }

    /// Check cross-field rules
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.tunnel.mode {
            Mode::Server => {
                self.bind_addr()?;
            }
            Mode::Client => validate_host_port(&self.tunnel.server_address)?,
        }
        Ok(())
    }

    /// Server listen address
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.tunnel
            .server_address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress {
                field: "ServerAddress".to_string(),
                value: self.tunnel.server_address.clone(),
            })
    }

    /// Client connection policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.tunnel.connect_attempts,
            retry_delay: self.tunnel.retry_delay,
            attempt_timeout: self.tunnel.connect_timeout,
        }
    }
}

/// Locate the config used when none is given on the command line
///
/// Looks for `configs/sealtun.conf` under the working directory, then
/// next to the executable.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let cwd = std::env::current_dir()?;
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    find_default_config(&cwd, exe_dir.as_deref()).ok_or_else(|| ConfigError::FileNotFound {
        path: Path::new(DEFAULT_CONFIG_DIR)
            .join(DEFAULT_CONFIG_FILE)
            .display()
            .to_string(),
    })
}

/// First of `<dir>/configs/sealtun.conf` that exists, in search order
fn find_default_config(cwd: &Path, exe_dir: Option<&Path>) -> Option<PathBuf> {
    std::iter::once(cwd)
        .chain(exe_dir)
        .map(|dir| dir.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Interface,
    Tunnel,
}

/// Values collected during parsing, before defaults and required-field checks
#[derive(Default)]
struct RawConfig {
    name: Option<String>,
    address: Option<Ipv4Net>,
    mtu: Option<u16>,
    mode: Option<Mode>,
    server_address: Option<String>,
    preshared_key: Option<[u8; 32]>,
    peer_timeout: Option<u64>,
    connect_attempts: Option<u32>,
    retry_delay: Option<u64>,
    connect_timeout: Option<u64>,
}

impl RawConfig {
    fn build(self) -> Result<TunnelConfig, ConfigError> {
        let missing = |field: &str| ConfigError::MissingField {
            field: field.to_string(),
        };

        let interface = InterfaceConfig {
            name: self.name,
            address: self.address.ok_or_else(|| missing("Address"))?,
            mtu: self.mtu.unwrap_or(DEFAULT_MTU),
        };

        let tunnel = TunnelSettings {
            mode: self.mode.ok_or_else(|| missing("Mode"))?,
            server_address: self.server_address.ok_or_else(|| missing("ServerAddress"))?,
            preshared_key: self.preshared_key.ok_or_else(|| missing("PreSharedKey"))?,
            peer_timeout: self
                .peer_timeout
                .map(Duration::from_secs)
                .unwrap_or(PEER_TIMEOUT),
            connect_attempts: self.connect_attempts.unwrap_or(MAX_CONNECT_ATTEMPTS),
            retry_delay: self
                .retry_delay
                .map(Duration::from_secs)
                .unwrap_or(RETRY_DELAY),
            connect_timeout: self
                .connect_timeout
                .map(Duration::from_secs)
                .unwrap_or(CONNECT_TIMEOUT),
        };

        Ok(TunnelConfig { interface, tunnel })
    }
}

/// Drop a trailing `# comment`
fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Parse a strictly positive integer option
fn parse_number<T>(value: &str, field: &str, line_num: usize) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
{
    let number: T = value.parse().map_err(|_| ConfigError::ParseError {
        line: line_num,
        message: format!("Invalid {}: {}", field, value),
    })?;

    if number == T::default() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(number)
}

/// Parse a base64-encoded 32-byte key
pub fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| ConfigError::InvalidKey {
            field: field_name.to_string(),
        })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// `host:port` with a non-empty host and non-zero port
fn validate_host_port(value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidAddress {
        field: "ServerAddress".to_string(),
        value: value.to_string(),
    };

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(()),
        _ => Err(invalid()),
    }
}
