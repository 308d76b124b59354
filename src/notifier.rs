//! Renders sales into channel messages and delivers them through a [`Publisher`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::retry::{self, Classify, ErrorClass, RetryError, RetryPolicy};
use crate::types::{Attribute, Sale};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Rolling window used for message pacing.
const PACING_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PublishError {
    /// The bot may not post to the channel. Needs an operator.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transient delivery failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
}

impl Classify for PublishError {
    fn class(&self) -> ErrorClass {
        match self {
            PublishError::PermissionDenied(_) => ErrorClass::Fatal,
            PublishError::Transient {
                retry_after: Some(hint),
                ..
            } => ErrorClass::RateLimited(Some(*hint)),
            PublishError::Transient { .. } => ErrorClass::Transient,
        }
    }

    fn kind(&self) -> &'static str {
        "DeliveryError"
    }
}

/// Handle to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef(pub i64);

/// Notification channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, text: &str) -> Result<MessageRef, PublishError>;

    async fn pin(&self, message: MessageRef) -> Result<(), PublishError>;
}

/// Result of one `notify` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { pinned: bool },
    Failed,
    /// Fatal for the run; the operator has to fix channel permissions.
    PermissionDenied,
}

/// Formats a sale and pushes it to the publisher under the retry policy.
pub struct Notifier<P> {
    publisher: P,
    policy: RetryPolicy,
    pin_threshold: Option<Decimal>,
    max_per_minute: usize,
    sent: VecDeque<Instant>,
}

impl<P: Publisher> Notifier<P> {
    pub fn new(
        publisher: P,
        policy: RetryPolicy,
        pin_threshold: Option<Decimal>,
        max_per_minute: usize,
    ) -> Self {
        Self {
            publisher,
            policy,
            pin_threshold,
            max_per_minute: max_per_minute.max(1),
            sent: VecDeque::new(),
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub async fn notify(&mut self, sale: &Sale) -> Delivery {
        self.pace().await;

        let text = render_message(sale);
        let publisher = &self.publisher;
        let result = retry::execute(&self.policy, "publish", None, || publisher.publish(&text)).await;
        self.sent.push_back(Instant::now());

        let message = match result {
            Ok(message) => message,
            Err(RetryError::Fatal(PublishError::PermissionDenied(reason))) => {
                warn!(sale = %sale.id, "Publisher denied permission: {reason}");
                return Delivery::PermissionDenied;
            }
            Err(e) => {
                warn!(sale = %sale.id, kind = "DeliveryError", "Skipping notification: {e}");
                return Delivery::Failed;
            }
        };
        info!("Sent: {} #{} for {} TON", sale.gift_name, sale.gift_number, sale.sale_price);

        let pinned = match self.pin_threshold {
            Some(threshold) if sale.sale_price >= threshold => {
                match self.publisher.pin(message).await {
                    Ok(()) => {
                        info!("Pinned high-value sale: {} TON", sale.sale_price);
                        true
                    }
                    Err(e) => {
                        warn!("Failed to pin message: {e}");
                        false
                    }
                }
            }
            _ => false,
        };

        Delivery::Delivered { pinned }
    }

    /// Wait until the rolling window has room for one more message.
    async fn pace(&mut self) {
        loop {
            let now = Instant::now();
            while self
                .sent
                .front()
                .is_some_and(|t| now.duration_since(*t) >= PACING_WINDOW)
            {
                self.sent.pop_front();
            }
            if self.sent.len() < self.max_per_minute {
                return;
            }
            let Some(oldest) = self.sent.front().copied() else {
                return;
            };
            let wait = PACING_WINDOW.saturating_sub(now.duration_since(oldest));
            info!("Message rate limit reached, waiting {wait:?}");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Public link to the gift's page. The slug keeps only alphanumerics
/// ("Durov's Cap" becomes `DurovsCap`), so it is safe inside an HTML attribute.
pub fn gift_url(sale: &Sale) -> String {
    let slug: String = sale
        .gift_name
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    format!("https://t.me/nft/{slug}-{}", sale.gift_number)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn attribute_line(label: &str, attr: &Attribute) -> String {
    format!(
        "├ {label}: {} ({}‰)",
        escape_html(&attr.name),
        attr.rarity_per_mille.normalize()
    )
}

/// Render the channel message (Telegram HTML).
pub fn render_message(sale: &Sale) -> String {
    let name = escape_html(&sale.gift_name);
    let floor = sale
        .floor_price
        .map(|p| format!("{} TON", p.normalize()))
        .unwrap_or_else(|| "n/a".to_string());

    let mut lines = vec![
        format!("<a href='{}'>{name} #{}</a>", gift_url(sale), sale.gift_number),
        String::new(),
        "┌─🎉 GIFT SOLD!".to_string(),
        "│".to_string(),
        format!("├ Gift Name: {name}"),
        format!("├ Gift ID: {}", escape_html(&sale.gift_id)),
        format!("├ Floor Price: {floor}"),
        format!("├ Sold For: {} TON", sale.sale_price.normalize()),
        "│".to_string(),
    ];
    if let Some(model) = &sale.model {
        lines.push(attribute_line("Model", model));
    }
    if let Some(symbol) = &sale.symbol {
        lines.push(attribute_line("Symbol", symbol));
    }
    if let Some(backdrop) = &sale.backdrop {
        lines.push(attribute_line("Backdrop", backdrop));
    }
    lines.push("│".to_string());
    lines.push(format!(
        "└─ Date: {}",
        sale.sold_at.format("%Y-%m-%d %H:%M UTC")
    ));
    lines.join("\n")
}

// ── Telegram Bot API ───────────────────────────────────────────────

/// Posts to a channel through the Telegram Bot API.
pub struct TelegramPublisher {
    http: reqwest::Client,
    base: String,
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct BotResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    parameters: Option<BotResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct BotResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramPublisher {
    pub fn new(bot_token: &str, chat_id: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: format!("{TELEGRAM_API_BASE}/bot{bot_token}"),
            chat_id: chat_id.to_string(),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, PublishError> {
        let resp = self
            .http
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transient {
                // Strip the URL: it embeds the bot token.
                message: e.without_url().to_string(),
                retry_after: None,
            })?;
        let status = resp.status().as_u16();
        let parsed: BotResponse<T> = resp.json().await.map_err(|e| PublishError::Transient {
            message: format!("unreadable response (HTTP {status}): {}", e.without_url()),
            retry_after: None,
        })?;
        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(classify_bot_error(
                parsed.error_code.unwrap_or(status),
                parsed.description.unwrap_or_default(),
                parsed.parameters.and_then(|p| p.retry_after),
            )),
        }
    }
}

fn classify_bot_error(code: u16, description: String, retry_after: Option<u64>) -> PublishError {
    let lower = description.to_lowercase();
    match code {
        401 | 403 => PublishError::PermissionDenied(description),
        400 if lower.contains("chat not found") || lower.contains("not enough rights") => {
            PublishError::PermissionDenied(description)
        }
        429 => PublishError::Transient {
            message: description,
            retry_after: Some(Duration::from_secs(retry_after.unwrap_or(1))),
        },
        _ => PublishError::Transient {
            message: format!("HTTP {code}: {description}"),
            retry_after: None,
        },
    }
}

#[async_trait]
impl Publisher for TelegramPublisher {
    async fn publish(&self, text: &str) -> Result<MessageRef, PublishError> {
        let sent: SentMessage = self
            .call(
                "sendMessage",
                serde_json::json!({
                    "chat_id": self.chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }),
            )
            .await?;
        Ok(MessageRef(sent.message_id))
    }

    async fn pin(&self, message: MessageRef) -> Result<(), PublishError> {
        let _: bool = self
            .call(
                "pinChatMessage",
                serde_json::json!({
                    "chat_id": self.chat_id,
                    "message_id": message.0,
                    "disable_notification": false,
                }),
            )
            .await?;
        Ok(())
    }
}
