//! HTTP client for the consumer's `/proof` endpoint.
//!
//! Proof bodies larger than the chunk threshold are split into ordered
//! base64 chunks and posted one by one; the intake reassembles them.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use flora_common::types::split_into_chunks;
use flora_common::ProofPayload;

/// Stay comfortably under the consumer's 1 MB body limit.
const DEFAULT_CHUNK_THRESHOLD: usize = 768 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("consumer request failed: {0}")]
    Request(String),
    #[error("consumer rejected proof ({status}): {reason}")]
    Rejected { status: u16, reason: String },
    #[error("proof could not be chunked: {0}")]
    Chunking(String),
}

pub struct ConsumerClient {
    base_url: String,
    http: reqwest::Client,
    chunk_threshold: usize,
}

impl ConsumerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Request(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
        })
    }

    #[cfg(test)]
    fn with_chunk_threshold(mut self, threshold: usize) -> Self {
        self.chunk_threshold = threshold;
        self
    }

    /// Post a proof, chunking transparently when it is too large for a
    /// single body.
    pub async fn post_proof(&self, proof: &ProofPayload) -> Result<(), ClientError> {
        let body = serde_json::to_vec(proof).map_err(|e| ClientError::Request(e.to_string()))?;
        if body.len() <= self.chunk_threshold {
            return self.post_json(&body).await;
        }

        let chunks = split_into_chunks(proof, self.chunk_threshold / 2)
            .map_err(|e| ClientError::Chunking(e.to_string()))?;
        debug!(epoch = proof.epoch, parts = chunks.len(), "posting chunked proof");
        for chunk in &chunks {
            let body =
                serde_json::to_vec(chunk).map_err(|e| ClientError::Request(e.to_string()))?;
            self.post_json(&body).await?;
        }
        Ok(())
    }

    async fn post_json(&self, body: &[u8]) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/proof", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let reason = response.text().await.unwrap_or_default();
        Err(ClientError::Rejected { status: status.as_u16(), reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client =
            ConsumerClient::new("http://127.0.0.1:8080/", Duration::from_secs(5)).expect("client");
        assert_eq!(client.base_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn threshold_override_for_tests() {
        let client = ConsumerClient::new("http://x", Duration::from_secs(5))
            .expect("client")
            .with_chunk_threshold(128);
        assert_eq!(client.chunk_threshold, 128);
    }
}
