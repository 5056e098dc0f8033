use crate::config::TelegramConfig;
use crate::entity::EntityKey;
use crate::severity::SeverityLevel;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, UNIX_EPOCH};
use teloxide::prelude::*;
use teloxide::types::{ChatId, ParseMode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
    #[error("telegram bot token not found: set '{0}' in the environment or telegram.bot_token in config")]
    MissingToken(String),
    #[error("telegram.chat_ids is empty: configure at least one chat id")]
    NoChats,
}

/// One entity changing severity during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionReport {
    pub key: EntityKey,
    pub severity: SeverityLevel,
    pub previous: SeverityLevel,
    pub annotation: String,
    pub at_unix_ms: i64,
    /// Whether the entity is configured to raise alerts.
    pub alert: bool,
}

impl TransitionReport {
    /// Entered an unacknowledged down state.
    pub fn is_outage(&self) -> bool {
        is_alerting_down(self.severity) && !self.previous.is_down_class()
    }

    pub fn is_recovery(&self) -> bool {
        is_alerting_down(self.previous)
            && !self.severity.is_down_class()
            && self.severity != SeverityLevel::Unknown
    }
}

fn is_alerting_down(level: SeverityLevel) -> bool {
    matches!(level, SeverityLevel::Down | SeverityLevel::DownDependency)
}

#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &str;

    async fn report(&self, reports: &[TransitionReport]) -> Result<(), ReportError>;
}

#[derive(Debug, Default, Clone)]
pub struct TracingReporter;

#[async_trait]
impl Reporter for TracingReporter {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn report(&self, reports: &[TransitionReport]) -> Result<(), ReportError> {
        for r in reports {
            if r.severity.is_down_class() {
                warn!(
                    entity = %r.key,
                    from = %r.previous,
                    to = %r.severity,
                    annotation = %r.annotation,
                    "entity transition"
                );
            } else {
                info!(
                    entity = %r.key,
                    from = %r.previous,
                    to = %r.severity,
                    annotation = %r.annotation,
                    "entity transition"
                );
            }
        }
        Ok(())
    }
}

/// Sends outage and recovery notices for alerting entities to Telegram.
pub struct TelegramReporter {
    bot: Bot,
    chat_ids: Vec<i64>,
    limiter: Mutex<RateLimiter>,
}

impl TelegramReporter {
    pub fn new(bot: Bot, chat_ids: Vec<i64>, rate_limit_per_minute: u32) -> Self {
        Self {
            bot,
            chat_ids,
            limiter: Mutex::new(RateLimiter::new(rate_limit_per_minute)),
        }
    }

    pub fn from_config(cfg: &TelegramConfig) -> Result<Self, ReportError> {
        let token = resolve_token(cfg)?;
        Ok(Self::new(
            Bot::new(token),
            cfg.chat_ids.clone(),
            cfg.rate_limit_per_minute,
        ))
    }
}

#[async_trait]
impl Reporter for TelegramReporter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn report(&self, reports: &[TransitionReport]) -> Result<(), ReportError> {
        let lines = alert_lines(reports);
        if lines.is_empty() {
            return Ok(());
        }
        let text = format!("<b>Network health</b>\n{}", lines.join("\n"));
        let now = now_unix();

        let mut last_err = None;
        for chat_id in &self.chat_ids {
            if !self.limiter.lock().await.allow(*chat_id, now) {
                warn!(chat_id = *chat_id, "telegram rate limit reached, dropping alert");
                continue;
            }
            if let Err(err) = self
                .bot
                .send_message(ChatId(*chat_id), text.clone())
                .parse_mode(ParseMode::Html)
                .await
            {
                warn!(chat_id = *chat_id, error = %err, "failed to send telegram alert");
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

fn alert_lines(reports: &[TransitionReport]) -> Vec<String> {
    reports
        .iter()
        .filter(|r| r.alert)
        .filter_map(|r| {
            let label = if r.is_outage() {
                "DOWN"
            } else if r.is_recovery() {
                "RECOVERED"
            } else {
                return None;
            };
            Some(format!(
                "<code>{}</code> - <b>{label}</b> ({} -&gt; {}) {} at {}",
                escape_html(&r.key.to_string()),
                r.previous,
                r.severity,
                escape_html(&r.annotation),
                humantime::format_rfc3339_seconds(
                    UNIX_EPOCH + Duration::from_millis(r.at_unix_ms.max(0) as u64)
                ),
            ))
        })
        .collect()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn resolve_token(cfg: &TelegramConfig) -> Result<String, ReportError> {
    if cfg.chat_ids.is_empty() {
        return Err(ReportError::NoChats);
    }
    let env_token = std::env::var(&cfg.bot_token_env)
        .ok()
        .filter(|v| !v.trim().is_empty());
    let cfg_token = cfg
        .bot_token
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    env_token
        .or(cfg_token)
        .ok_or_else(|| ReportError::MissingToken(cfg.bot_token_env.clone()))
}

struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_unix: i64) -> bool {
        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while queue.front().is_some_and(|ts| now_unix - ts >= 60) {
            queue.pop_front();
        }
        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }
        queue.push_back(now_unix);
        true
    }
}

fn now_unix() -> i64 {
    crate::entity::now_unix_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::OsiLayer;
    use SeverityLevel::*;

    fn report(id: &str, previous: SeverityLevel, severity: SeverityLevel, alert: bool) -> TransitionReport {
        TransitionReport {
            key: EntityKey::new(OsiLayer::Network, id),
            severity,
            previous,
            annotation: "0/4 replies from <gw>".to_string(),
            at_unix_ms: 1_700_000_000_000,
            alert,
        }
    }

    #[test]
    fn rate_limiter_enforces_limit() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow(1, 10));
        assert!(limiter.allow(1, 20));
        assert!(!limiter.allow(1, 30));
        assert!(limiter.allow(2, 30));
        assert!(limiter.allow(1, 71));
    }

    #[test]
    fn outage_and_recovery_classification() {
        assert!(report("a", Normal, Down, true).is_outage());
        assert!(report("a", Slow, DownDependency, true).is_outage());
        assert!(!report("a", Down, DownDependency, true).is_outage());
        assert!(report("a", DownDependency, Normal, true).is_recovery());
        assert!(!report("a", Down, Unknown, true).is_recovery());
        assert!(!report("a", Normal, Degraded, true).is_recovery());
        assert!(!report("a", Normal, DownAcknowledged, true).is_outage());
    }

    #[test]
    fn only_alerting_entities_produce_lines() {
        let lines = alert_lines(&[
            report("gw", Normal, Down, true),
            report("quiet", Normal, Down, false),
            report("flaky", Normal, Slow, true),
            report("back", Down, Normal, true),
        ]);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("network:gw"));
        assert!(lines[0].contains("DOWN"));
        assert!(lines[0].contains("&lt;gw&gt;"));
        assert!(lines[0].contains("2023-11-14T22:13:20Z"));
        assert!(lines[1].contains("RECOVERED"));
    }

    #[test]
    fn token_resolution_requires_chats_and_token() {
        let mut cfg = TelegramConfig {
            bot_token_env: "NETMOND_TEST_TOKEN_UNSET".to_string(),
            ..TelegramConfig::default()
        };
        assert!(matches!(resolve_token(&cfg), Err(ReportError::NoChats)));
        cfg.chat_ids = vec![42];
        assert!(matches!(resolve_token(&cfg), Err(ReportError::MissingToken(_))));
        cfg.bot_token = Some(" 123:abc ".to_string());
        assert_eq!(resolve_token(&cfg).unwrap(), "123:abc");
    }

    #[tokio::test]
    async fn tracing_reporter_accepts_everything() {
        TracingReporter
            .report(&[report("gw", Normal, Down, false)])
            .await
            .unwrap();
    }
}
