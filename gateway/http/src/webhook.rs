//! Webhook source adapter: each source is one route on a shared port.

use crate::config::WebhookConfig;
use crate::server::PortRegistry;
use async_trait::async_trait;
use axum::http::Method;
use futures_util::StreamExt;
use gateway_core::adapter::{Adapter, Error, MessageStream};
use gateway_core::source::SourceIdentity;
use tracing::info;

/// Source type served by [`WebhookAdapter`].
pub const SOURCE_TYPE: &str = "webhook";

/// Adapter turning HTTP requests into source messages.
///
/// The route lives inside the returned stream, so dropping the stream is what
/// releases the path.
#[derive(Debug, Clone, Default)]
pub struct WebhookAdapter {
    registry: PortRegistry,
}

impl WebhookAdapter {
    pub fn new(registry: PortRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Adapter for WebhookAdapter {
    fn source_type(&self) -> &str {
        SOURCE_TYPE
    }

    async fn validate(&self, source: &SourceIdentity) -> Result<(), Error> {
        WebhookConfig::parse(&source.raw_config)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, source), name = "webhook.start", fields(source = %source.name))]
    async fn start(&self, source: &SourceIdentity) -> Result<MessageStream, Error> {
        let config = WebhookConfig::parse(&source.raw_config)?;
        let method = Method::from_bytes(config.method.as_bytes())?;
        let route = self
            .registry
            .register(config.port, &config.endpoint, method)
            .await?;
        info!(port = config.port, endpoint = %config.endpoint, "Webhook source listening");
        Ok(route.map(Ok).boxed())
    }

    async fn stop(&self, _source: &SourceIdentity) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn adapter() -> WebhookAdapter {
        WebhookAdapter::new(PortRegistry::new().bind_host("127.0.0.1"))
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_endpoint() {
        let source = SourceIdentity::new("example", "port: 12000", "t1");
        assert!(adapter().validate(&source).await.is_err());
    }

    #[tokio::test]
    async fn test_requests_become_messages() {
        let port = free_port();
        let source = SourceIdentity::new(
            "example",
            &format!("port: \"{port}\"\nendpoint: /example"),
            "t1",
        );
        let adapter = adapter();
        adapter.validate(&source).await.unwrap();
        let mut stream = adapter.start(&source).await.unwrap();

        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/example"))
            .header("content-type", "application/json")
            .body(r#"{"id":1}"#)
            .send()
            .await
            .unwrap();

        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.payload, Bytes::from(r#"{"id":1}"#));
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_dropping_stream_frees_route() {
        let port = free_port();
        let raw = format!("port: {port}\nendpoint: /example");
        let adapter = adapter();

        let first = adapter
            .start(&SourceIdentity::new("a", &raw, "t1"))
            .await
            .unwrap();
        assert!(adapter
            .start(&SourceIdentity::new("b", &raw, "t1"))
            .await
            .is_err());

        drop(first);
        assert!(adapter
            .start(&SourceIdentity::new("b", &raw, "t2"))
            .await
            .is_ok());
    }
}
