use super::{Discoverer, EntityRecord};
use crate::entity::{EntityKey, HttpAttrs, LayerAttributes, TransportAttrs};
use crate::error::MonitorError;
use crate::severity::SeverityLevel;
use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TcpTarget {
    pub key: EntityKey,
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
    pub slow_threshold_ms: f64,
    pub depends_on: Vec<EntityKey>,
}

#[derive(Debug, Clone)]
pub struct HttpTarget {
    pub key: EntityKey,
    pub url: String,
    pub timeout_ms: u64,
    pub expected_status: u16,
    pub slow_threshold_ms: f64,
    pub depends_on: Vec<EntityKey>,
}

pub struct TransportDiscoverer {
    targets: Vec<TcpTarget>,
}

impl TransportDiscoverer {
    pub fn new(targets: Vec<TcpTarget>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl Discoverer for TransportDiscoverer {
    fn name(&self) -> &str {
        "transport"
    }

    async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError> {
        let mut records = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            records.push(run_tcp_check(target).await);
        }
        Ok(records)
    }
}

pub struct HttpDiscoverer {
    client: Client,
    targets: Vec<HttpTarget>,
}

impl HttpDiscoverer {
    pub fn new(client: Client, targets: Vec<HttpTarget>) -> Self {
        Self { client, targets }
    }
}

#[async_trait]
impl Discoverer for HttpDiscoverer {
    fn name(&self) -> &str {
        "http"
    }

    async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError> {
        let mut records = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            records.push(run_http_check(&self.client, target).await);
        }
        Ok(records)
    }
}

async fn run_tcp_check(target: &TcpTarget) -> EntityRecord {
    let start = Instant::now();
    let addr = format!("{}:{}", target.host, target.port);

    let outcome = time::timeout(
        Duration::from_millis(target.timeout_ms),
        TcpStream::connect(&addr),
    )
    .await;
    let latency = start.elapsed();

    let (connected, severity, annotation) = match outcome {
        Ok(Ok(_stream)) => {
            let ms = latency.as_secs_f64() * 1000.0;
            if ms > target.slow_threshold_ms {
                (true, SeverityLevel::Slow, format!("connected to {addr} in {ms:.1} ms"))
            } else {
                (true, SeverityLevel::Normal, format!("connected to {addr}"))
            }
        }
        Ok(Err(err)) => {
            warn!(check = %target.key, address = %addr, error = %err, "tcp check failed");
            (false, SeverityLevel::Down, format!("connect to {addr} failed: {err}"))
        }
        Err(_) => {
            warn!(check = %target.key, address = %addr, "tcp check timed out");
            (
                false,
                SeverityLevel::Down,
                format!("connect to {addr} timed out after {} ms", target.timeout_ms),
            )
        }
    };

    EntityRecord::new(target.key.clone(), severity, annotation)
        .with_attributes(LayerAttributes::Transport(TransportAttrs {
            address: addr,
            connected,
            latency_ms: latency.as_millis() as u64,
        }))
        .depends_on(target.depends_on.iter().cloned())
}

async fn run_http_check(client: &Client, target: &HttpTarget) -> EntityRecord {
    let start = Instant::now();
    let req = client
        .get(&target.url)
        .timeout(Duration::from_millis(target.timeout_ms));

    let result = req.send().await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (status_code, severity, annotation) = match result {
        Ok(resp) => {
            let code = resp.status().as_u16();
            if code != target.expected_status {
                (
                    code,
                    SeverityLevel::Degraded,
                    format!("status {code}, expected {}", target.expected_status),
                )
            } else if latency_ms > target.slow_threshold_ms {
                (code, SeverityLevel::Slow, format!("status {code} in {latency_ms:.0} ms"))
            } else {
                (code, SeverityLevel::Normal, format!("status {code}"))
            }
        }
        Err(err) => {
            warn!(check = %target.key, error = %err, "http check failed");
            let what = if err.is_timeout() { "timed out" } else { "failed" };
            (0, SeverityLevel::Down, format!("request {what}: {err}"))
        }
    };

    EntityRecord::new(target.key.clone(), severity, annotation)
        .with_attributes(LayerAttributes::Http(HttpAttrs {
            url: target.url.clone(),
            status_code,
            latency_ms,
        }))
        .depends_on(target.depends_on.iter().cloned())
}
