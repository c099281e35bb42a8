use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use crate::core::{ChunkTransport, Result, UploadError, UploadSession};

/// Default request timeout: 5 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub timeout: Duration,
    /// Sent with every request, e.g. `Authorization`.
    pub headers: HashMap<String, String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompleteResponse {
    #[serde(rename = "fileUrl")]
    file_url: Option<String>,
    url: Option<String>,
}

/// Chunk transport over HTTP: multipart chunk posts and a JSON completion call.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_config(HttpTransportConfig::default())
    }

    pub fn with_config(config: HttpTransportConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            headers.insert(
                HeaderName::from_bytes(key.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        Ok(Self { client, headers })
    }

    /// `<destination>/complete`, keeping the destination path intact.
    pub fn completion_url(destination: &Url) -> Result<Url> {
        let mut url = destination.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::InvalidOptions(format!("Invalid destination: {}", destination)))?
            .pop_if_empty()
            .push("complete");
        Ok(url)
    }

    async fn check_status(response: Response, context: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            context.to_string()
        } else {
            format!("{}: {}", context, body)
        };
        Err(UploadError::server_error(status.as_u16(), message))
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn upload_chunk(
        &self,
        destination: &Url,
        session: &UploadSession,
        index: usize,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let length = data.len() as u64;
        let part = Part::stream_with_length(reqwest::Body::from(data), length)
            .file_name(session.file_name.clone())
            .mime_str("application/octet-stream")?;

        let form = Form::new()
            .part("chunk", part)
            .text("chunkIndex", index.to_string())
            .text("sessionId", session.session_id.to_string())
            .text("fileName", session.file_name.clone())
            .text("totalChunks", session.total_chunks.to_string());

        let request = self
            .client
            .post(destination.clone())
            .headers(self.headers.clone())
            .multipart(form)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            response = request => response?,
        };

        Self::check_status(response, &format!("Failed to upload chunk {}", index)).await?;
        debug!("Chunk {}/{} of {} accepted", index + 1, session.total_chunks, session.file_id);

        Ok(())
    }

    async fn complete_upload(
        &self,
        destination: &Url,
        session: &UploadSession,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = Self::completion_url(destination)?;

        let request = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .json(&serde_json::json!({
                "sessionId": session.session_id,
                "fileName": session.file_name,
                "fileSize": session.file_size,
                "totalChunks": session.total_chunks,
            }))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            response = request => response?,
        };

        let response = Self::check_status(response, "Failed to complete upload").await?;
        let status = response.status().as_u16();
        let result: CompleteResponse = response.json().await?;

        result
            .file_url
            .or(result.url)
            .ok_or_else(|| UploadError::server_error(status, "No fileUrl in completion response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_url() {
        let url = Url::parse("http://localhost:8080/api/upload").unwrap();
        assert_eq!(
            HttpTransport::completion_url(&url).unwrap().as_str(),
            "http://localhost:8080/api/upload/complete"
        );

        let url = Url::parse("http://localhost:8080/api/upload/").unwrap();
        assert_eq!(
            HttpTransport::completion_url(&url).unwrap().as_str(),
            "http://localhost:8080/api/upload/complete"
        );
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut config = HttpTransportConfig::default();
        config.headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(HttpTransport::with_config(config), Err(UploadError::InvalidHeader(_))));
    }
}
