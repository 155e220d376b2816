//! Generic webhook notification channel.
//!
//! Chat platforms with incoming webhooks accept this payload directly or
//! through a thin relay.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{ChannelDeliverer, DeliveryError};
use crate::Result;
use crate::notification::request::NotificationRequest;

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Channel identifier.
    pub id: String,
    /// Whether the channel is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Webhook URL.
    pub url: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication type.
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            id: "webhook".to_string(),
            enabled: false,
            url: String::new(),
            method: default_method(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Generic webhook notification channel.
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    /// Create a new webhook channel.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        if config.enabled && config.url.trim().is_empty() {
            return Err(crate::Error::config(format!(
                "webhook channel {} has no url",
                config.id
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {}", token).parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, value);
                }
            }
            // Basic auth is applied on the request builder.
            Some(WebhookAuth::Basic { .. }) | None => {}
        }

        headers
    }

    /// Build the JSON payload.
    fn build_payload(&self, request: &NotificationRequest) -> serde_json::Value {
        json!({
            "id": request.id(),
            "priority": request.priority().as_str(),
            "subject": request.subject(),
            "body": request.body(),
            "labels": request.labels(),
            "correlation_id": request.correlation_id(),
            "timestamp": request.created_at().to_rfc3339(),
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout(Duration::from_secs(self.config.timeout_secs))
        } else if err.is_connect() {
            DeliveryError::Connection(err.to_string())
        } else if err.is_builder() {
            DeliveryError::Rejected(err.to_string())
        } else {
            DeliveryError::Other(format!("webhook request failed: {err}"))
        }
    }
}

#[async_trait]
impl ChannelDeliverer for WebhookChannel {
    fn channel_type(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, request: &NotificationRequest) -> std::result::Result<(), DeliveryError> {
        let payload = self.build_payload(request);
        let headers = self.build_headers();

        let mut builder = match self.config.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&self.config.url),
            _ => self.client.post(&self.config.url),
        };

        builder = builder.headers(headers).json(&payload);

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            builder = builder.basic_auth(username, Some(password));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                channel = %self.config.id,
                status = status.as_u16(),
                "Webhook delivery rejected"
            );
            return Err(DeliveryError::Http {
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            channel = %self.config.id,
            notification_id = request.id(),
            "Webhook notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_config_default() {
        let config = WebhookConfig::default();
        assert!(!config.enabled);
        assert!(config.url.is_empty());
        assert_eq!(config.method, "POST");
        assert_eq!(config.timeout_secs, 30);
    }

    #[test]
    fn enabled_without_url_is_a_config_error() {
        let config = WebhookConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(WebhookChannel::new(config).is_err());
    }

    #[test]
    fn test_build_payload() {
        let channel = WebhookChannel::new(WebhookConfig::default()).unwrap();
        let request = NotificationRequest::builder("Remediation failed", "rollback exhausted")
            .id("n-1")
            .label("cluster", "east")
            .correlation_id("incident-42")
            .build();

        let payload = channel.build_payload(&request);
        assert_eq!(payload["id"], "n-1");
        assert_eq!(payload["priority"], "medium");
        assert_eq!(payload["labels"]["cluster"], "east");
        assert_eq!(payload["correlation_id"], "incident-42");
    }

    #[test]
    fn test_build_headers_with_bearer() {
        let config = WebhookConfig {
            enabled: true,
            url: "https://example.com/webhook".to_string(),
            headers: vec![("X-Team".to_string(), "sre".to_string())],
            auth: Some(WebhookAuth::Bearer {
                token: "test-token".to_string(),
            }),
            ..Default::default()
        };
        let channel = WebhookChannel::new(config).unwrap();
        let headers = channel.build_headers();

        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer test-token"
        );
        assert_eq!(headers.get("x-team").unwrap(), "sre");
    }

    /// Serve a single HTTP exchange with a canned status line.
    async fn serve_once(status_line: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy"
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/hook")
    }

    #[tokio::test]
    async fn non_success_status_is_reported_with_code() {
        let url = serve_once("503 Service Unavailable").await;
        let channel = WebhookChannel::new(WebhookConfig {
            enabled: true,
            url,
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap();
        let request = NotificationRequest::builder("s", "b").build();

        let err = channel.deliver(&request).await.unwrap_err();
        assert_eq!(
            err,
            DeliveryError::Http {
                status: 503,
                body: "busy".to_string()
            }
        );
    }

    #[tokio::test]
    async fn success_status_delivers() {
        let url = serve_once("200 OK").await;
        let channel = WebhookChannel::new(WebhookConfig {
            enabled: true,
            url,
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap();
        let request = NotificationRequest::builder("s", "b").build();

        assert!(channel.deliver(&request).await.is_ok());
    }
}
