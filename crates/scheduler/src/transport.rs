//! Transports that carry a request's bytes
//!
//! The primary transport streams the body and reports progress. The fallback
//! is a plain one-shot GET that reports nothing until the payload is complete.

use crate::config::SchedulerConfig;
use crate::error::TransportError;
use crate::request::ProgressSink;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A way of fetching one URL
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url`, reporting byte progress through `progress` when supported.
    async fn fetch(&self, url: &str, progress: &ProgressSink) -> Result<Bytes, TransportError>;

    /// Whether `fetch` reports intermediate progress.
    ///
    /// A primary transport that cannot is skipped in favour of the fallback.
    fn reports_progress(&self) -> bool {
        true
    }

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Streaming GET reporting progress after every chunk
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str, progress: &ProgressSink) -> Result<Bytes, TransportError> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let total = response.content_length();

        let mut body = BytesMut::with_capacity(total.unwrap_or(0).min(16 << 20) as usize);
        progress.report(0, total);

        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            progress.report(body.len() as u64, total);
        }

        debug!(url, bytes = body.len(), "streamed transfer complete");
        Ok(body.freeze())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// One-shot GET without progress
#[derive(Debug, Clone)]
pub struct PlainTransport {
    client: Client,
}

impl PlainTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for PlainTransport {
    async fn fetch(&self, url: &str, _progress: &ProgressSink) -> Result<Bytes, TransportError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?)
    }

    fn reports_progress(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "plain"
    }
}

/// Primary and fallback transport pair used by a queue
#[derive(Clone)]
pub struct Transports {
    pub primary: Arc<dyn Transport>,
    pub fallback: Arc<dyn Transport>,
}

impl Transports {
    pub fn new(primary: Arc<dyn Transport>, fallback: Arc<dyn Transport>) -> Self {
        Self { primary, fallback }
    }

    /// HTTP transports sharing one connection pool
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn http(config: &SchedulerConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self::new(
            Arc::new(HttpTransport::new(client.clone())),
            Arc::new(PlainTransport::new(client)),
        ))
    }
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transports")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_pair() {
        let transports = Transports::http(&SchedulerConfig::default()).unwrap();

        assert!(transports.primary.reports_progress());
        assert!(!transports.fallback.reports_progress());
        assert_eq!(
            format!("{transports:?}"),
            "Transports { primary: \"http\", fallback: \"plain\" }"
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_connection_error() {
        let transports = Transports::http(&SchedulerConfig::default()).unwrap();

        // port 9 on loopback: nothing listens there in a test sandbox
        let err = transports
            .primary
            .fetch("http://127.0.0.1:9/page.jpg", &ProgressSink::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Connection(_)));
    }
}
