use anyhow::Context;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};

/// Default port of the launcher. The game link listens one above it.
pub const DEFAULT_PORT: u16 = 4444;

/// Command-line arguments of the relay binary.
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Relays a local game connection to a multiplayer server")]
pub struct Args {
    /// Multiplayer server to relay to, as `host:port`.
    #[arg(long, env = "RELAY_SERVER")]
    pub server: String,
    /// Base local port. The game connects to `port + 1` on loopback.
    #[arg(long, env = "RELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl Args {
    /// Resolves the server address into a `RelayConfig`.
    pub async fn resolve(&self) -> anyhow::Result<RelayConfig> {
        let remote_address = tokio::net::lookup_host(&self.server)
            .await
            .with_context(|| format!("failed to resolve {}", self.server))?
            .next()
            .with_context(|| format!("{} resolved to no addresses", self.server))?;
        let listen_port = self
            .port
            .checked_add(1)
            .context("port leaves no room for the game link")?;
        Ok(RelayConfig {
            remote_address,
            listen_port,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Remote server, used for both the stream and the datagram transport.
    pub remote_address: SocketAddr,
    /// Loopback port the game connects to.
    pub listen_port: u16,
}

impl RelayConfig {
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            remote_address,
            listen_port: DEFAULT_PORT + 1,
        }
    }

    pub fn listen_address(&self) -> SocketAddr {
        (Ipv4Addr::LOCALHOST, self.listen_port).into()
    }
}
