//! API gateway configuration.
//!
//! The gateway listen address comes from `API_ADDR`; the embedded node is
//! configured through `bidchain::ChainConfig::from_env()`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Configuration for the API gateway HTTP server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        // All interfaces, so a container port mapping reaches it.
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8081),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut cfg = Self::default();
        if let Ok(addr) = std::env::var("API_ADDR") {
            cfg.listen_addr = addr
                .parse()
                .map_err(|e| format!("invalid API_ADDR {addr:?}: {e}"))?;
        }
        Ok(cfg)
    }
}
