//! Console notification channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ChannelDeliverer, DeliveryError};
use crate::notification::request::NotificationRequest;

/// Console channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Channel identifier.
    #[serde(default = "default_id")]
    pub id: String,
    /// Whether the channel is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Include labels in the output line.
    #[serde(default)]
    pub include_labels: bool,
}

fn default_id() -> String {
    "console".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            enabled: true,
            include_labels: false,
        }
    }
}

/// Writes one line per notification to an async writer.
pub struct ConsoleChannel<W = Stdout> {
    config: ConsoleConfig,
    writer: Mutex<W>,
}

impl ConsoleChannel<Stdout> {
    /// Console channel writing to the process stdout.
    pub fn stdout(config: ConsoleConfig) -> Self {
        Self::with_writer(config, tokio::io::stdout())
    }
}

impl<W> ConsoleChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn with_writer(config: ConsoleConfig, writer: W) -> Self {
        Self {
            config,
            writer: Mutex::new(writer),
        }
    }

    /// Consume the channel and return the writer.
    pub fn into_writer(self) -> W {
        self.writer.into_inner()
    }

    fn format_line(&self, request: &NotificationRequest) -> String {
        let mut line = format!(
            "[{}] [{}] {}: {}",
            request.created_at().to_rfc3339(),
            request.priority().as_str().to_ascii_uppercase(),
            request.subject(),
            request.body().replace('\n', " ")
        );
        if self.config.include_labels && !request.labels().is_empty() {
            let labels: Vec<String> = request
                .labels()
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            line.push_str(&format!(" {{{}}}", labels.join(",")));
        }
        line.push('\n');
        line
    }
}

#[async_trait]
impl<W> ChannelDeliverer for ConsoleChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn channel_type(&self) -> &'static str {
        "console"
    }

    async fn deliver(&self, request: &NotificationRequest) -> Result<(), DeliveryError> {
        let line = self.format_line(request);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DeliveryError::Other(format!("console write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| DeliveryError::Other(format!("console flush failed: {e}")))?;

        debug!(notification_id = request.id(), "Console notification written");
        Ok(())
    }
}
