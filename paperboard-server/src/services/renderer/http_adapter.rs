use super::{RenderArtifact, RenderRequest, Renderer};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use url::Url;

pub struct HttpRenderer {
    client: Client,
    endpoint: Url,
}

impl HttpRenderer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).with_context(|| format!("invalid renderer URL '{}'", endpoint))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderArtifact> {
        let res = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("Render service error {}: {}", status, body));
        }

        let mime_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let content = res.bytes().await?.to_vec();

        if content.is_empty() {
            return Err(anyhow!("Render service returned an empty body"));
        }

        Ok(RenderArtifact { content, mime_type })
    }
}
