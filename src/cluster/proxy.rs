//! Cluster proxy client
//!
//! Issues authenticated streaming HTTP calls to a peer node's internal
//! cluster endpoints and relays the byte streams. Request bodies are sent
//! chunk-by-chunk as they become available (push payload sizes are not
//! known up front) and response bodies are consumed incrementally by the
//! caller via `bytes_stream`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("remote node returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("cluster call failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct ClusterProxyClient {
    http: reqwest::Client,
    credential: String,
}

impl ClusterProxyClient {
    pub fn new(credential: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            credential,
        }
    }

    fn url(&self, node: &str, path: &str) -> String {
        format!("http://{node}/~cluster/{path}")
    }

    /// Propagate a non-success remote status as a typed failure carrying
    /// the remote message.
    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(ProxyError::Remote {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Streaming GET against a peer's internal endpoint.
    pub async fn get(
        &self,
        node: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, ProxyError> {
        let response = self
            .http
            .get(self.url(node, path))
            .query(query)
            .bearer_auth(&self.credential)
            .send()
            .await?;
        Self::checked(response).await
    }

    /// Streaming POST: `body` is forwarded as a chunked stream, never
    /// buffered whole.
    pub async fn post_stream(
        &self,
        node: &str,
        path: &str,
        query: &[(&str, String)],
        body: reqwest::Body,
    ) -> Result<reqwest::Response, ProxyError> {
        let response = self
            .http
            .post(self.url(node, path))
            .query(query)
            .bearer_auth(&self.credential)
            .body(body)
            .send()
            .await?;
        Self::checked(response).await
    }

    pub async fn delete(
        &self,
        node: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<(), ProxyError> {
        let response = self
            .http
            .delete(self.url(node, path))
            .query(query)
            .bearer_auth(&self.credential)
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }
}
