//! Raw connections to other services
//!
//! A [`Connector`] dials an endpoint; the resulting [`Connection`] can be probed
//! for health and closed. The manager only talks to these traits.

use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use crate::error::{Error, Result};

/// HTTP health endpoint probed on peers
pub const HTTP_HEALTH_PATH: &str = "/api/v1/health";

/// Transport handle exposed to typed clients
#[derive(Debug, Clone)]
pub enum Transport {
    Grpc(Channel),
    Http { client: reqwest::Client, base_url: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    fn endpoint(&self) -> String;

    /// Handle for issuing calls, `None` for connections without one
    fn transport(&self) -> Option<Transport>;

    /// Ask the peer whether it is serving
    async fn probe(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `endpoint`, giving up after `dial_timeout`
    async fn connect(&self, endpoint: &str, dial_timeout: Duration) -> Result<Box<dyn Connection>>;
}

/// gRPC connections over a tonic channel
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, endpoint: &str, dial_timeout: Duration) -> Result<Box<dyn Connection>> {
        let uri = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };

        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::Connection(format!("Invalid endpoint URI for {endpoint}: {e}")))?
            .connect_timeout(dial_timeout)
            .connect()
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to {endpoint}: {e}")))?;

        Ok(Box::new(GrpcConnection {
            endpoint: endpoint.to_string(),
            channel,
        }))
    }
}

pub struct GrpcConnection {
    endpoint: String,
    channel: Channel,
}

#[async_trait]
impl Connection for GrpcConnection {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn transport(&self) -> Option<Transport> {
        Some(Transport::Grpc(self.channel.clone()))
    }

    async fn probe(&self) -> Result<()> {
        let mut client = HealthClient::new(self.channel.clone());
        let response = client
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await
            .map_err(|status| {
                Error::Connection(format!("Health check to {} failed: {status}", self.endpoint))
            })?;

        match response.into_inner().status() {
            ServingStatus::Serving => Ok(()),
            other => Err(Error::Connection(format!(
                "{} reported {}",
                self.endpoint,
                other.as_str_name()
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        // dropping the last channel clone tears down the connection
        Ok(())
    }
}

/// Plain HTTP connections through reqwest
#[derive(Debug, Clone, Copy)]
pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    #[must_use]
    pub const fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, endpoint: &str, dial_timeout: Duration) -> Result<Box<dyn Connection>> {
        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| Error::Connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Box::new(HttpConnection {
            base_url: endpoint.trim_end_matches('/').to_string(),
            client,
        }))
    }
}

pub struct HttpConnection {
    base_url: String,
    client: reqwest::Client,
}

#[async_trait]
impl Connection for HttpConnection {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    fn transport(&self) -> Option<Transport> {
        Some(Transport::Http {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
        })
    }

    async fn probe(&self) -> Result<()> {
        let url = format!("{}{HTTP_HEALTH_PATH}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Health check to {url} failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Connection(format!(
                "Health check to {url} returned {}",
                response.status()
            )))
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grpc_connector_rejects_bad_uri() {
        let result = GrpcConnector.connect("bad host:1", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_http_connection_exposes_transport() {
        let conn = HttpConnector::default()
            .connect("http://127.0.0.1:8080/", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(conn.endpoint(), "http://127.0.0.1:8080");
        assert!(matches!(conn.transport(), Some(Transport::Http { .. })));
        assert!(conn.close().await.is_ok());
    }
}
