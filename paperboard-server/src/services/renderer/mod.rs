mod http_adapter;
mod placeholder_adapter;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RenderConfig;

pub use http_adapter::HttpRenderer;
pub use placeholder_adapter::PlaceholderRenderer;

/// Everything the render service needs to produce one image.
#[derive(Debug, Clone, Serialize)]
pub struct RenderRequest {
    pub plugin_instance_id: i32,
    pub definition: String,
    pub instance_name: String,
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderArtifact {
    pub content: Vec<u8>,
    pub mime_type: String,
}

/// Trait for render backends
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<RenderArtifact>;
}

/// Picks the backend from config: the external render service when a URL is
/// configured, otherwise a local placeholder.
pub fn from_config(config: &RenderConfig) -> Result<Arc<dyn Renderer>> {
    match config.renderer_url.as_deref() {
        Some(endpoint) => {
            let timeout = Duration::from_secs(config.request_timeout_secs);
            Ok(Arc::new(HttpRenderer::new(endpoint, timeout)?))
        }
        None => {
            tracing::warn!("No render.renderer_url configured; serving placeholder images");
            Ok(Arc::new(PlaceholderRenderer))
        }
    }
}
