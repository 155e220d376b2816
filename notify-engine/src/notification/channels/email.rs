//! Email notification channel using SMTP.
//!
//! Sends plain-text mail through an SMTP relay with `lettre`, which is how
//! cluster-local mail relays are usually exposed. TLS termination is left to
//! the relay.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChannelDeliverer, DeliveryError};
use crate::notification::request::NotificationRequest;
use crate::{Error, Result};

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Channel identifier.
    pub id: String,
    /// Whether the channel is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// SMTP server host.
    pub smtp_host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub smtp_port: u16,
    /// SMTP username.
    #[serde(default)]
    pub smtp_username: Option<String>,
    /// SMTP password.
    #[serde(default)]
    pub smtp_password: Option<String>,
    /// Sender email address.
    pub from_address: String,
    /// Recipient email addresses.
    pub to_addresses: Vec<String>,
    /// Subject prefix.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// SMTP command timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    25
}

fn default_subject_prefix() -> String {
    "[notify]".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            id: "email".to_string(),
            enabled: false,
            smtp_host: "localhost".to_string(),
            smtp_port: default_port(),
            smtp_username: None,
            smtp_password: None,
            from_address: String::new(),
            to_addresses: Vec::new(),
            subject_prefix: default_subject_prefix(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Email notification channel.
pub struct EmailChannel {
    config: EmailConfig,
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailChannel {
    /// Create a new email channel. Addresses are parsed up front.
    pub fn new(config: EmailConfig) -> Result<Self> {
        if config.smtp_host.trim().is_empty() {
            return Err(Error::config(format!(
                "email channel {} has no smtp_host",
                config.id
            )));
        }
        if config.to_addresses.is_empty() {
            return Err(Error::config(format!(
                "email channel {} needs to_addresses",
                config.id
            )));
        }

        let from = parse_mailbox(&config.id, &config.from_address)?;
        let to = config
            .to_addresses
            .iter()
            .map(|address| parse_mailbox(&config.id, address))
            .collect::<Result<Vec<_>>>()?;

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.smtp_host.as_str())
                .port(config.smtp_port)
                .timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            config,
            from,
            to,
        })
    }

    fn build_subject(&self, request: &NotificationRequest) -> String {
        single_line(&format!(
            "{} [{}] {}",
            self.config.subject_prefix,
            request.priority().as_str().to_ascii_uppercase(),
            request.subject()
        ))
    }

    fn build_message(
        &self,
        request: &NotificationRequest,
    ) -> std::result::Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(self.build_subject(request))
            .header(ContentType::TEXT_PLAIN)
            .raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str("X-Notification-Id"),
                single_line(request.id()),
            ));
        if let Some(correlation_id) = request.correlation_id() {
            builder = builder.raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str("X-Correlation-Id"),
                single_line(correlation_id),
            ));
        }
        for to in &self.to {
            builder = builder.to(to.clone());
        }

        builder
            .body(request.body().to_string())
            .map_err(|e| DeliveryError::Rejected(format!("invalid email message: {e}")))
    }

    fn map_smtp_error(&self, error: lettre::transport::smtp::Error) -> DeliveryError {
        if error.is_timeout() {
            return DeliveryError::Timeout(Duration::from_secs(self.config.connect_timeout_secs));
        }
        if let Some(code) = error.status()
            && let Ok(code) = code.to_string().parse::<u16>()
        {
            return DeliveryError::Smtp {
                code,
                message: error.to_string(),
            };
        }
        DeliveryError::Connection(format!(
            "{}:{}: {}",
            self.config.smtp_host, self.config.smtp_port, error
        ))
    }
}

fn parse_mailbox(channel: &str, address: &str) -> Result<Mailbox> {
    address.trim().parse().map_err(|e| {
        Error::config(format!(
            "email channel {channel} has an invalid address {address:?}: {e}"
        ))
    })
}

/// Collapse control characters so header values stay on one line.
fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[async_trait]
impl ChannelDeliverer for EmailChannel {
    fn channel_type(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, request: &NotificationRequest) -> std::result::Result<(), DeliveryError> {
        let message = self.build_message(request)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| self.map_smtp_error(e))?;
        debug!(
            channel = %self.config.id,
            notification_id = request.id(),
            recipients = self.to.len(),
            "Email notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> EmailConfig {
        EmailConfig {
            id: "oncall-mail".to_string(),
            enabled: true,
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: port,
            from_address: "notify@example.com".to_string(),
            to_addresses: vec!["oncall@example.com".to_string()],
            ..Default::default()
        }
    }

    fn formatted(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).into_owned()
    }

    /// Minimal scripted SMTP server. `greeting` and `rcpt_reply` let a test
    /// misbehave or reject recipients.
    async fn spawn_server(
        greeting: &'static str,
        rcpt_reply: &'static str,
    ) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut transcript = String::new();
            if reader.get_mut().write_all(greeting.as_bytes()).await.is_err() {
                return transcript;
            }
            let mut in_data = false;
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                transcript.push_str(&line);
                let reply: &str = if in_data {
                    if line == ".\r\n" {
                        in_data = false;
                        "250 queued\r\n"
                    } else {
                        continue;
                    }
                } else if line.starts_with("EHLO") {
                    "250-test\r\n250 AUTH PLAIN\r\n"
                } else if line.starts_with("MAIL FROM") {
                    "250 ok\r\n"
                } else if line.starts_with("RCPT TO") {
                    rcpt_reply
                } else if line.starts_with("DATA") {
                    in_data = true;
                    "354 go ahead\r\n"
                } else if line.starts_with("QUIT") {
                    let _ = reader.get_mut().write_all(b"221 bye\r\n").await;
                    break;
                } else {
                    "500 unknown\r\n"
                };
                if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            transcript
        });
        (port, handle)
    }

    #[test]
    fn missing_recipients_or_bad_addresses_are_config_errors() {
        let no_recipients = EmailConfig {
            enabled: true,
            from_address: "a@example.com".to_string(),
            ..Default::default()
        };
        assert!(EmailChannel::new(no_recipients).is_err());

        let bad_sender = EmailConfig {
            from_address: "not an address".to_string(),
            ..test_config(25)
        };
        assert!(matches!(
            EmailChannel::new(bad_sender),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn message_carries_subject_and_tracing_headers() {
        let channel = EmailChannel::new(test_config(25)).unwrap();
        let request = NotificationRequest::builder("Escalation", "line one\n.hidden")
            .correlation_id("incident-7")
            .build();

        let message = formatted(&channel.build_message(&request).unwrap());
        assert!(message.contains("Subject: [notify] [MEDIUM] Escalation\r\n"));
        assert!(message.contains("X-Correlation-Id: incident-7\r\n"));
        assert!(message.contains(&format!("X-Notification-Id: {}\r\n", request.id())));
        assert!(message.contains("To: oncall@example.com\r\n"));
    }

    #[test]
    fn line_breaks_in_subject_cannot_inject_smtp_commands() {
        let channel = EmailChannel::new(test_config(25)).unwrap();
        let request = NotificationRequest::builder("hi\r\n.\r\nRCPT TO:<evil@x>", "body")
            .correlation_id("incident-7\r\nBcc: evil@x")
            .build();

        let message = formatted(&channel.build_message(&request).unwrap());
        let (headers, _) = message.split_once("\r\n\r\n").unwrap();
        for line in headers.split("\r\n") {
            assert_ne!(line, ".");
            assert!(!line.starts_with("RCPT TO"), "injected line: {line:?}");
            assert!(!line.starts_with("Bcc:"), "injected line: {line:?}");
        }
        assert!(!message.split("\r\n").any(|line| line == "."));
    }

    #[tokio::test]
    async fn delivers_through_smtp_dialogue() {
        let (port, server) = spawn_server("220 test ESMTP\r\n", "250 ok\r\n").await;
        let channel = EmailChannel::new(test_config(port)).unwrap();
        let request = NotificationRequest::builder("Approval required", "restart pod").build();

        channel.deliver(&request).await.unwrap();
        drop(channel);

        let transcript = server.await.unwrap();
        assert!(transcript.contains("MAIL FROM:<notify@example.com>"));
        assert!(transcript.contains("RCPT TO:<oncall@example.com>"));
        assert!(transcript.contains("restart pod"));
    }

    #[tokio::test]
    async fn rejected_recipient_reports_smtp_code() {
        let (port, _server) = spawn_server("220 test ESMTP\r\n", "550 no such user\r\n").await;
        let channel = EmailChannel::new(test_config(port)).unwrap();
        let request = NotificationRequest::builder("s", "b").build();

        let err = channel.deliver(&request).await.unwrap_err();
        assert!(
            matches!(err, DeliveryError::Smtp { code: 550, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn malformed_reply_is_a_failure_not_a_panic() {
        let (port, _server) = spawn_server("22\u{e9} hello\r\n", "250 ok\r\n").await;
        let channel = EmailChannel::new(test_config(port)).unwrap();
        let request = NotificationRequest::builder("s", "b").build();

        let result = channel.deliver(&request).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_connection_failure() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let channel = EmailChannel::new(test_config(port)).unwrap();
        let request = NotificationRequest::builder("s", "b").build();

        let err = channel.deliver(&request).await.unwrap_err();
        assert!(
            matches!(err, DeliveryError::Connection(_) | DeliveryError::Timeout(_)),
            "unexpected error: {err:?}"
        );
    }
}
