//! Optical (QR) code decoding
//!
//! The relay never decodes images itself; it hands the image URL to a decode
//! service that answers `{"code":0,"data":{"contents":["<payload>"]}}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a code could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Decoder request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Decoder returned HTTP {0}")]
    Status(u16),

    #[error("Decoder rejected image with code {0}")]
    Rejected(i64),

    #[error("No code found in image")]
    Empty,
}

/// Turns an image reference into the payload of the code it shows
#[async_trait]
pub trait OpticalDecoder: Send + Sync {
    async fn decode(&self, image_url: &str) -> Result<String, DecodeError>;
}

#[derive(Debug, Deserialize)]
struct DecodeResponse {
    code: i64,
    #[serde(default)]
    data: Option<DecodeData>,
}

#[derive(Debug, Deserialize)]
struct DecodeData {
    #[serde(default)]
    contents: Vec<String>,
}

/// Decoder backed by an HTTP decode endpoint (`GET {endpoint}?file_url=...`)
pub struct HttpDecoder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDecoder {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DecodeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl OpticalDecoder for HttpDecoder {
    async fn decode(&self, image_url: &str) -> Result<String, DecodeError> {
        debug!(endpoint = %self.endpoint, %image_url, "HttpDecoder::decode: called");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("file_url", image_url)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Decoder returned non-success status");
            return Err(DecodeError::Status(status.as_u16()));
        }

        let body: DecodeResponse = response.json().await?;
        if body.code != 0 {
            return Err(DecodeError::Rejected(body.code));
        }
        body.data
            .and_then(|d| d.contents.into_iter().map(|c| c.trim().to_string()).find(|c| !c.is_empty()))
            .ok_or(DecodeError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1/read-qr-code", addr)
    }

    async fn echo_decoder(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        let url = params.get("file_url").cloned().unwrap_or_default();
        if url.ends_with("blank.jpg") {
            Json(json!({"code": 0, "data": {"contents": []}}))
        } else if url.ends_with("broken.jpg") {
            Json(json!({"code": 40001, "message": "bad image"}))
        } else {
            Json(json!({"code": 0, "message": "ok", "data": {"contents": [format!(" token-for-{} ", url)]}}))
        }
    }

    #[tokio::test]
    async fn test_http_decoder_outcomes() {
        let endpoint = serve(Router::new().route("/v1/read-qr-code", get(echo_decoder))).await;
        let decoder = HttpDecoder::new(endpoint, Duration::from_secs(5)).unwrap();

        let payload = decoder.decode("https://img/a.jpg").await.unwrap();
        assert_eq!(payload, "token-for-https://img/a.jpg");

        assert!(matches!(decoder.decode("https://img/blank.jpg").await, Err(DecodeError::Empty)));
        assert!(matches!(
            decoder.decode("https://img/broken.jpg").await,
            Err(DecodeError::Rejected(40001))
        ));
    }

    #[tokio::test]
    async fn test_http_decoder_status_error() {
        let endpoint = serve(Router::new()).await;
        let decoder = HttpDecoder::new(endpoint, Duration::from_secs(5)).unwrap();
        assert!(matches!(decoder.decode("https://img/a.jpg").await, Err(DecodeError::Status(404))));
    }
}
