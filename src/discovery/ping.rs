use super::{Discoverer, EntityRecord};
use crate::classifier::{ProbeOutcome, ProbeResult, ReachabilityClassifier};
use crate::command::{CommandOutput, CommandRunner};
use crate::config::ProbeSettings;
use crate::entity::{EntityKey, LayerAttributes, ReachabilityAttrs};
use crate::error::MonitorError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const RESOLVER_FAILURE_MARKERS: [&str; 4] = [
    "Name or service not known",
    "Temporary failure in name resolution",
    "unknown host",
    "No address associated with hostname",
];

#[derive(Debug, Clone)]
pub struct PingTarget {
    pub key: EntityKey,
    pub address: String,
    pub settings: ProbeSettings,
    pub classifier: ReachabilityClassifier,
    pub depends_on: Vec<EntityKey>,
}

pub struct PingDiscoverer {
    runner: Arc<dyn CommandRunner>,
    program: String,
    targets: Vec<PingTarget>,
}

impl PingDiscoverer {
    pub fn new(runner: Arc<dyn CommandRunner>, program: String, targets: Vec<PingTarget>) -> Self {
        Self {
            runner,
            program,
            targets,
        }
    }
}

#[async_trait]
impl Discoverer for PingDiscoverer {
    fn name(&self) -> &str {
        "ping"
    }

    async fn discover(&self) -> Result<Vec<EntityRecord>, MonitorError> {
        let mut set = JoinSet::new();
        for (idx, target) in self.targets.iter().enumerate() {
            let runner = self.runner.clone();
            let program = self.program.clone();
            let target = target.clone();
            set.spawn(async move {
                let record = probe_record(runner.as_ref(), &program, &target).await;
                (idx, record)
            });
        }

        let mut records = Vec::with_capacity(self.targets.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Ok(record))) => records.push((idx, record)),
                Ok((idx, Err(err))) => {
                    let target = &self.targets[idx];
                    warn!(address = %target.address, error = %err, "ping target failed");
                    records.push((
                        idx,
                        EntityRecord::unknown(target.key.clone(), &err)
                            .depends_on(target.depends_on.iter().cloned()),
                    ));
                }
                Err(err) => warn!(error = %err, "ping task failed"),
            }
        }
        records.sort_by_key(|(idx, _)| *idx);
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }
}

async fn probe_record(
    runner: &dyn CommandRunner,
    program: &str,
    target: &PingTarget,
) -> Result<EntityRecord, MonitorError> {
    let outcome = probe(runner, program, &target.address, &target.settings).await;
    let classification = target.classifier.classify_outcome(&outcome)?;
    let attrs = match &outcome {
        ProbeOutcome::Completed(result) => ReachabilityAttrs {
            address: target.address.clone(),
            sent: result.sent,
            received: result.received,
            avg_rtt_ms: result.average_rtt_ms(),
        },
        _ => ReachabilityAttrs {
            address: target.address.clone(),
            sent: 0,
            received: 0,
            avg_rtt_ms: None,
        },
    };
    Ok(EntityRecord::new(
        target.key.clone(),
        classification.severity,
        classification.annotation,
    )
    .with_attributes(LayerAttributes::Reachability(attrs))
    .depends_on(target.depends_on.iter().cloned()))
}

pub fn ping_argv(program: &str, address: &str, settings: &ProbeSettings) -> Vec<String> {
    let wait_secs = settings.timeout_ms.div_ceil(1000).max(1);
    vec![
        program.to_string(),
        "-n".to_string(),
        "-c".to_string(),
        settings.count.to_string(),
        "-W".to_string(),
        wait_secs.to_string(),
        address.to_string(),
    ]
}

/// Runs one ping probe and turns whatever happened into a `ProbeOutcome`.
pub async fn probe(
    runner: &dyn CommandRunner,
    program: &str,
    address: &str,
    settings: &ProbeSettings,
) -> ProbeOutcome {
    let argv = ping_argv(program, address, settings);
    // One second per echo request plus the reply wait of the last one.
    let budget = Duration::from_millis(
        u64::from(settings.count) * 1000 + settings.timeout_ms.max(1000),
    );
    match runner.run(&argv, budget).await {
        Ok(output) => interpret(address, &output),
        Err(MonitorError::ProbeTimeout { .. }) => ProbeOutcome::TimedOut {
            target: address.to_string(),
        },
        Err(err) => ProbeOutcome::Failed {
            target: address.to_string(),
            reason: err.to_string(),
        },
    }
}

fn interpret(address: &str, output: &CommandOutput) -> ProbeOutcome {
    let stdout = output.stdout_text();
    let stderr = output.stderr_text();

    let resolver_failure = RESOLVER_FAILURE_MARKERS
        .iter()
        .any(|m| stderr.contains(m) || stdout.contains(m));
    if output.exit_code == 2 || resolver_failure {
        let detail = stderr.lines().next().unwrap_or("").trim();
        return ProbeOutcome::NameResolutionFailed {
            target: address.to_string(),
            detail: if detail.is_empty() {
                format!("ping exited with {}", output.exit_code)
            } else {
                detail.to_string()
            },
        };
    }

    match parse_ping_output(address, &stdout) {
        Ok(result) => ProbeOutcome::Completed(result),
        Err(err) => {
            debug!(address, error = %err, "unparseable ping output");
            ProbeOutcome::Failed {
                target: address.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Extracts the transmitted/received summary and per-reply RTTs from
/// iputils-style ping output.
pub fn parse_ping_output(address: &str, text: &str) -> Result<ProbeResult, MonitorError> {
    let mut rtt_samples = Vec::new();
    let mut summary = None;

    for line in text.lines() {
        if let Some(pos) = line.find("time=") {
            let value = line[pos + 5..]
                .split_whitespace()
                .next()
                .and_then(|v| v.trim_end_matches("ms").parse::<f64>().ok());
            if let Some(ms) = value {
                rtt_samples.push(ms);
            }
        }
        if line.contains("packets transmitted") {
            summary = Some(parse_summary(line)?);
        }
    }

    let (sent, received) =
        summary.ok_or_else(|| MonitorError::parse("ping", "missing packet summary"))?;
    Ok(ProbeResult {
        target: address.to_string(),
        sent,
        received,
        rtt_samples,
    })
}

fn parse_summary(line: &str) -> Result<(u32, u32), MonitorError> {
    let mut parts = line.split(',');
    let leading = |part: Option<&str>, what: &str| -> Result<u32, MonitorError> {
        part.and_then(|p| p.split_whitespace().next())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| MonitorError::parse("ping", format!("bad {what} count in '{line}'")))
    };
    let sent = leading(parts.next(), "transmitted")?;
    let received = leading(parts.next(), "received")?;
    Ok((sent, received))
}
