//! Configuration parsing for sealtun
//!
//! This module handles parsing of `.conf` files with `[Interface]` and
//! `[Tunnel]` sections.

mod parser;

pub use parser::{
    default_config_path, parse_key, InterfaceConfig, Mode, TunnelConfig, TunnelSettings,
    DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE, DEFAULT_MTU,
};
