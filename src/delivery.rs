//! Delivery of summary segments.
//!
//! A [`Delivery`] receives the ordered segments produced by
//! [`segment`](distill_core::segment::segment) and sends each one, in order,
//! with its `(i/n)` marker. Two targets exist:
//!
//! - **[`StdoutDelivery`]**: prints the segments; the default.
//! - **[`DiscordDelivery`]**: posts to every configured channel through the
//!   Discord REST API. A channel that fails is logged and skipped; the
//!   delivery only fails when no channel received the full sequence.

use std::io::Write;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use distill_core::models::MessageSegment;
use distill_core::retry::RetryPolicy;

use crate::config::DeliveryConfig;
use crate::retry::Retrier;

/// Environment variable holding the Discord bot token.
pub const DISCORD_TOKEN_ENV: &str = "DISCORD_BOT_TOKEN";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{target}: HTTP {status}: {body}")]
    Http {
        target: String,
        status: u16,
        body: String,
    },
    #[error("{target}: {reason}")]
    Transport { target: String, reason: String },
    #[error("delivery failed for every target: {}", failed.join(", "))]
    AllTargetsFailed { failed: Vec<String> },
    #[error("delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Http { status, .. } => *status == 429 || *status >= 500,
            DeliveryError::Transport { .. } => true,
            DeliveryError::AllTargetsFailed { .. } | DeliveryError::Cancelled => false,
        }
    }
}

#[async_trait]
pub trait Delivery: Send + Sync {
    fn name(&self) -> String;

    /// Send every segment, in order. Returns the number of messages sent.
    async fn deliver(
        &self,
        segments: &[MessageSegment],
        cancel: &CancellationToken,
    ) -> Result<usize, DeliveryError>;
}

/// Prints rendered segments to stdout, separated by blank lines.
pub struct StdoutDelivery;

#[async_trait]
impl Delivery for StdoutDelivery {
    fn name(&self) -> String {
        "stdout".to_string()
    }

    async fn deliver(
        &self,
        segments: &[MessageSegment],
        _cancel: &CancellationToken,
    ) -> Result<usize, DeliveryError> {
        let mut out = std::io::stdout().lock();
        for (i, seg) in segments.iter().enumerate() {
            if i > 0 {
                let _ = writeln!(out);
            }
            writeln!(out, "{}", seg.render()).map_err(|e| DeliveryError::Transport {
                target: "stdout".to_string(),
                reason: e.to_string(),
            })?;
        }
        let _ = out.flush();
        Ok(segments.len())
    }
}

/// Posts segments to Discord channels with a bot token.
pub struct DiscordDelivery {
    client: reqwest::Client,
    api_base: String,
    token: String,
    channel_ids: Vec<u64>,
    policy: RetryPolicy,
}

impl DiscordDelivery {
    pub fn new(token: impl Into<String>, channel_ids: Vec<u64>, api_base: &str) -> Result<Self> {
        if channel_ids.is_empty() {
            bail!("no Discord channels configured (delivery.discord_channel_ids)");
        }
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.into(),
            channel_ids,
            policy: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1_000,
                max_delay_ms: 5_000,
                jitter: 0.1,
            },
        })
    }

    /// Build from config, taking the token from `DISCORD_BOT_TOKEN`.
    pub fn from_env(config: &DeliveryConfig) -> Result<Self> {
        let token = match std::env::var(DISCORD_TOKEN_ENV) {
            Ok(t) if !t.trim().is_empty() => t,
            _ => bail!("{} environment variable not set", DISCORD_TOKEN_ENV),
        };
        Self::new(
            token,
            config.discord_channel_ids.clone(),
            &config.discord_api_base,
        )
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn post(&self, channel_id: u64, content: &str) -> Result<(), DeliveryError> {
        let target = format!("discord:{}", channel_id);
        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DeliveryError::Http {
            target,
            status: status.as_u16(),
            body,
        })
    }

    async fn deliver_to_channel(
        &self,
        retrier: &Retrier,
        channel_id: u64,
        segments: &[MessageSegment],
    ) -> Result<(), DeliveryError> {
        for seg in segments {
            let content = seg.render();
            retrier
                .run("discord", DeliveryError::is_transient, |_| {
                    self.post(channel_id, &content)
                })
                .await
                .map_err(|e| e.into_error().unwrap_or(DeliveryError::Cancelled))?;
            tracing::debug!(
                channel = channel_id,
                seq = seg.seq,
                total = seg.total,
                "segment sent"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for DiscordDelivery {
    fn name(&self) -> String {
        format!("discord ({} channels)", self.channel_ids.len())
    }

    async fn deliver(
        &self,
        segments: &[MessageSegment],
        cancel: &CancellationToken,
    ) -> Result<usize, DeliveryError> {
        let retrier = Retrier::new(self.policy, cancel.clone());
        let mut sent = 0;
        let mut failed = Vec::new();

        for &channel_id in &self.channel_ids {
            match self.deliver_to_channel(&retrier, channel_id, segments).await {
                Ok(()) => {
                    sent += segments.len();
                    tracing::info!(
                        channel = channel_id,
                        segments = segments.len(),
                        "delivered"
                    );
                }
                Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                Err(e) => {
                    tracing::warn!(channel = channel_id, error = %e, "channel delivery failed");
                    failed.push(format!("discord:{}", channel_id));
                }
            }
        }

        if failed.len() == self.channel_ids.len() {
            return Err(DeliveryError::AllTargetsFailed { failed });
        }
        Ok(sent)
    }
}

/// Discord when `deliver` is set, stdout otherwise.
pub fn create_delivery(config: &DeliveryConfig, deliver: bool) -> Result<Box<dyn Delivery>> {
    if deliver {
        Ok(Box::new(DiscordDelivery::from_env(config)?))
    } else {
        Ok(Box::new(StdoutDelivery))
    }
}
