use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capabilities::{ConfigSource, HealthCheckProbe};
use crate::config::{DriverKind, ProbeConf};
use crate::models::ProbeResult;

/// Liveness probe over plain HTTP.
///
/// Simulated nodes always answer. Real nodes are probed with
/// `GET http://{address}{path}`; any 2xx counts as alive.
pub struct HttpProbe {
    client: reqwest::Client,
    config: Arc<dyn ConfigSource>,
    path: String,
}

impl HttpProbe {
    pub fn new(config: Arc<dyn ConfigSource>, probe: ProbeConf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(probe.timeout_ms))
            .build()?;
        Ok(Self { client, config, path: probe.path })
    }

    fn url(&self, address: &str) -> String {
        let path = if self.path.starts_with('/') { self.path.clone() } else { format!("/{}", self.path) };
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}{}", address.trim_end_matches('/'), path)
        } else {
            format!("http://{}{}", address, path)
        }
    }
}

#[async_trait]
impl HealthCheckProbe for HttpProbe {
    async fn check(&self, node: &str) -> anyhow::Result<ProbeResult> {
        let conf = self
            .config
            .node(node)?
            .ok_or_else(|| anyhow::anyhow!("node {node} is not configured"))?;
        if conf.driver == DriverKind::Mock {
            return Ok(ProbeResult::ok(0));
        }
        let Some(address) = conf.address.as_deref() else {
            return Ok(ProbeResult::failed("no address configured"));
        };

        let started = Instant::now();
        match self.client.get(self.url(address)).send().await {
            Ok(resp) if resp.status().is_success() => Ok(ProbeResult::ok(started.elapsed().as_millis() as u64)),
            Ok(resp) => Ok(ProbeResult::failed(format!("HTTP {}", resp.status()))),
            Err(e) if e.is_timeout() => Ok(ProbeResult::failed("timeout")),
            Err(e) => Ok(ProbeResult::failed(e.to_string())),
        }
    }
}
