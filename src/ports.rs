use anyhow::{bail, Result};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use crate::config::READY_HOST;
use crate::models::PortMapping;

/// Local → external port associations for the lifetime of the run.
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    mappings: Vec<PortMapping>,
}

impl From<&[PortMapping]> for PortTable {
    fn from(mappings: &[PortMapping]) -> Self {
        Self { mappings: mappings.to_vec() }
    }
}

impl PortTable {
    pub fn external_for(&self, local: u16) -> Option<u16> {
        self.mappings.iter().find(|m| m.local_port == local).map(|m| m.external_port)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortMapping> {
        self.mappings.iter()
    }
}

/// True when something already accepts connections on the local port.
pub async fn is_bound(port: u16) -> bool {
    TcpStream::connect((READY_HOST, port)).await.is_ok()
}

/// Local ports that are taken before anything was started.
pub async fn preflight(table: &PortTable) -> Vec<u16> {
    let mut taken = vec![];
    for m in table.iter() {
        if is_bound(m.local_port).await {
            tracing::warn!("local port {} (external {}) is already bound", m.local_port, m.external_port);
            taken.push(m.local_port);
        }
    }
    taken
}

/// Polls `127.0.0.1:port` until a connection succeeds or `timeout` passes.
pub async fn wait_for_port(port: u16, timeout: Duration, interval: Duration) -> Result<Duration> {
    let started = Instant::now();
    loop {
        if is_bound(port).await {
            return Ok(started.elapsed());
        }
        if started.elapsed() >= timeout {
            bail!("port {} did not open within {:?}", port, timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
