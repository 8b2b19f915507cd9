//! Version information for portlink.

use serde::Serialize;

use crate::handshake::SUPPORTED_VERSION;

/// Crate version from Cargo.toml.
pub const PORTLINK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub portlink: &'static str,
    /// Wire protocol version exchanged in the handshake.
    pub protocol: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            portlink: PORTLINK_VERSION,
            protocol: SUPPORTED_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
