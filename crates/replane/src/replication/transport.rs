//! The fetch seam of the replication driver.
//!
//! `Connector` abstracts "open one streaming request"; the default
//! implementation speaks HTTP through reqwest. Tests (and embedders with
//! their own HTTP stacks) substitute their own connector, so everything
//! above this seam is exercised without a network.

use crate::model::ReplayBody;
use crate::Error;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

/// Validated response body: raw chunks of the event stream.
pub type ByteStream = BoxStream<'static, crate::Result<bytes::Bytes>>;

/// One replication connection attempt.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: url::Url,
    pub sdk_key: String,
    /// `User-Agent` value; `None` leaves the header unset.
    pub agent: Option<String>,
    pub body: ReplayBody,
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open the stream and validate the response. Dropping the returned
    /// stream aborts the underlying request.
    async fn open(&self, request: StreamRequest) -> crate::Result<ByteStream>;
}

pub struct HttpConnector {
    http: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connector for HttpConnector {
    async fn open(&self, request: StreamRequest) -> crate::Result<ByteStream> {
        let mut builder = self
            .http
            .post(request.url.clone())
            .bearer_auth(&request.sdk_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.body);
        if let Some(agent) = &request.agent {
            builder = builder.header(reqwest::header::USER_AGENT, agent);
        }

        let response = builder.send().await?;
        match response.status().as_u16() {
            200..=299 => {}
            401 => return Err(Error::Auth),
            403 => return Err(Error::Forbidden),
            404 => return Err(Error::EndpointNotFound),
            status if status >= 500 => return Err(Error::Server(status)),
            status => return Err(Error::Client(status)),
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("text/event-stream") {
            return Err(Error::ContentType(content_type.to_string()));
        }

        Ok(response.bytes_stream().map_err(Error::from).boxed())
    }
}
