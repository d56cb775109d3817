//! Node reset capabilities: Wake-on-LAN magic packet, or an operator supplied command.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::process::Command;

use crate::capabilities::{ConfigSource, NodeResetter};
use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("no MAC address configured for {0}")]
    MissingMac(String),
    #[error("invalid MAC address: {0}")]
    InvalidMac(&'static str),
    #[error("invalid reset command: {0}")]
    InvalidCommand(String),
    #[error("reset command exited with {0}")]
    CommandFailed(std::process::ExitStatus),
    #[error("magic packet could not be sent")]
    SendFailed,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn parse_mac(mac: &str) -> Result<[u8; 6], ResetError> {
    let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return Err(ResetError::InvalidMac("bad mac len"));
    }
    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| ResetError::InvalidMac("bad mac hex"))?;
    }
    Ok(out)
}

fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0xFFu8; 102];
    // 6 x 0xFF, then the MAC 16 times
    for i in 0..16 {
        let base = 6 + i * 6;
        pkt[base..base + 6].copy_from_slice(&mac);
    }
    pkt
}

fn parse_broadcast(hint: Option<&str>) -> Ipv4Addr {
    hint.and_then(|s| s.parse::<Ipv4Addr>().ok())
        .unwrap_or(Ipv4Addr::BROADCAST)
}

/// Restarts a node by waking it: magic packet broadcast on UDP ports 9 and 7.
pub struct WakeOnLanResetter {
    config: Arc<dyn ConfigSource>,
}

impl WakeOnLanResetter {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self { config }
    }

    async fn wake(&self, node: &str) -> Result<(), ResetError> {
        let conf = self
            .config
            .node(node)?
            .ok_or_else(|| ResetError::UnknownNode(node.to_string()))?;
        let mac = conf.mac.as_deref().ok_or_else(|| ResetError::MissingMac(node.to_string()))?;
        let pkt = magic_packet(parse_mac(mac)?);
        let bcast = parse_broadcast(conf.hint.as_deref());

        let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
        sock.set_broadcast(true)?;

        let mut ok = false;
        for port in [9u16, 7u16] {
            match sock.send_to(&pkt, SocketAddrV4::new(bcast, port)).await {
                Ok(_) => ok = true,
                Err(e) => tracing::warn!(node, %bcast, port, error = %e, "WOL send error"),
            }
        }
        if ok { Ok(()) } else { Err(ResetError::SendFailed) }
    }
}

#[async_trait]
impl NodeResetter for WakeOnLanResetter {
    async fn restart(&self, node: &str) -> anyhow::Result<()> {
        self.wake(node).await?;
        tracing::info!(node, "magic packet sent");
        Ok(())
    }
}

/// Restarts a node with a command template, ex: `/opt/fleet/power-cycle.sh {node} {mac} {hint}`.
pub struct CommandResetter {
    template: String,
    config: Arc<dyn ConfigSource>,
}

impl CommandResetter {
    pub fn new(template: impl Into<String>, config: Arc<dyn ConfigSource>) -> Self {
        Self { template: template.into(), config }
    }

    fn build_argv(&self, node: &str, mac: &str, hint: &str) -> Result<Vec<String>, ResetError> {
        let argv = shell_words::split(&self.template)
            .map_err(|e| ResetError::InvalidCommand(e.to_string()))?
            .into_iter()
            .map(|arg| arg.replace("{node}", node).replace("{mac}", mac).replace("{hint}", hint))
            .collect::<Vec<_>>();
        if argv.is_empty() {
            return Err(ResetError::InvalidCommand("empty command".into()));
        }
        Ok(argv)
    }
}

#[async_trait]
impl NodeResetter for CommandResetter {
    async fn restart(&self, node: &str) -> anyhow::Result<()> {
        let conf = self.config.node(node)?.unwrap_or_default();
        let argv = self.build_argv(
            node,
            conf.mac.as_deref().unwrap_or_default(),
            conf.hint.as_deref().unwrap_or_default(),
        )?;
        let status = Command::new(&argv[0]).args(&argv[1..]).status().await.map_err(ResetError::from)?;
        if !status.success() {
            return Err(ResetError::CommandFailed(status).into());
        }
        tracing::info!(node, command = %argv[0], "reset command completed");
        Ok(())
    }
}
