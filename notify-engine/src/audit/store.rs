//! Audit storage and dead-letter collaborators.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::event::AuditEvent;
use crate::{Error, Result};

/// Primary audit storage.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a batch. Any error is treated as retryable by the pipeline.
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()>;
}

/// Last-resort sink for batches the primary store refused.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn push(&self, batch: &[AuditEvent]) -> Result<()>;
}

/// HTTP audit store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAuditStoreConfig {
    /// Endpoint that accepts `{"events": [...]}` as a JSON POST.
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    10
}

/// Audit store backed by an HTTP endpoint.
pub struct HttpAuditStore {
    config: HttpAuditStoreConfig,
    client: Client,
}

impl HttpAuditStore {
    pub fn new(config: HttpAuditStoreConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::config("audit endpoint url must not be empty"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl AuditStore for HttpAuditStore {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let mut request = self
            .client
            .post(&self.config.url)
            .json(&serde_json::json!({ "events": events }));
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::audit(format!(
                "audit store returned HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        debug!(count = events.len(), "Wrote audit batch");
        Ok(())
    }
}

/// In-memory store. Usable as either the primary store or the dead-letter
/// queue; mostly useful for tests and the demo binary.
#[derive(Default)]
pub struct InMemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryAuditStore {
    async fn push(&self, batch: &[AuditEvent]) -> Result<()> {
        self.events.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Dead-letter queue appending one JSON object per line to a file.
pub struct FileDeadLetterQueue {
    path: PathBuf,
    // Serializes appends so batches never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileDeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every dead-lettered event, oldest first.
    pub async fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl DeadLetterQueue for FileDeadLetterQueue {
    async fn push(&self, batch: &[AuditEvent]) -> Result<()> {
        let mut buf = Vec::new();
        for event in batch {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationRequest;

    fn events(n: usize) -> Vec<AuditEvent> {
        let request = NotificationRequest::builder("s", "b").build();
        (0..n)
            .map(|_| AuditEvent::circuit_open(&request, "webhook"))
            .collect()
    }

    #[tokio::test]
    async fn file_dead_letter_queue_appends_batches() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = FileDeadLetterQueue::new(dir.path().join("dlq").join("audit.jsonl"));

        assert!(dlq.read_all().await.unwrap().is_empty());

        let first = events(2);
        let second = events(3);
        dlq.push(&first).await.unwrap();
        dlq.push(&second).await.unwrap();

        let stored = dlq.read_all().await.unwrap();
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[0], first[0]);
        assert_eq!(stored[4], second[2]);
    }

    #[tokio::test]
    async fn in_memory_store_collects_batches() {
        let store = InMemoryAuditStore::new();
        store.write_batch(&events(4)).await.unwrap();
        DeadLetterQueue::push(&store, &events(1)).await.unwrap();
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn http_store_requires_url() {
        let config = HttpAuditStoreConfig {
            url: String::new(),
            bearer_token: None,
            timeout_secs: 5,
        };
        assert!(HttpAuditStore::new(config).is_err());
    }

    #[tokio::test]
    async fn http_store_reports_server_errors() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut buf).await;
            let body = "down";
            let response = format!(
                "HTTP/1.1 500 Internal Server Error\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let store = HttpAuditStore::new(HttpAuditStoreConfig {
            url: format!("http://{addr}/audit"),
            bearer_token: Some("secret".into()),
            timeout_secs: 5,
        })
        .unwrap();

        let err = store.write_batch(&events(1)).await.unwrap_err();
        assert!(matches!(err, Error::Audit(msg) if msg.contains("500")));
    }
}
