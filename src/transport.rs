// src/transport.rs

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use bytes::Bytes;

use crate::error::FetchError;
use crate::models::SegmentSource;

/// Body of a response, delivered chunk by chunk.
pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Headers the engine cares about plus the streamed body.
pub struct TransportResponse {
    pub status: u16,
    /// Length of this response's body as advertised by the server.
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The server honoured a `Range` request.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }
}

/// One GET against the remote platform. Implementations perform a single
/// attempt; retrying is the worker pool's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, source: &SegmentSource) -> Result<TransportResponse, FetchError>;
}

/// `reqwest`-backed transport used in production.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, source: &SegmentSource) -> Result<TransportResponse, FetchError> {
        let mut request = self.client.get(source.url.clone());
        if let Some(range) = &source.range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let response = request.send().await?;

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();

        Ok(TransportResponse {
            status,
            content_length,
            content_type,
            body,
        })
    }
}
