use super::{RenderArtifact, RenderRequest, Renderer};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

/// Draws a plain 800x480 card with the instance name. Used when no render
/// service is configured so devices still get something to show.
pub struct PlaceholderRenderer;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl Renderer for PlaceholderRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<RenderArtifact> {
        let svg = format!(
            concat!(
                r#"<svg xmlns="http://www.w3.org/2000/svg" width="800" height="480">"#,
                r#"<rect width="800" height="480" fill="white"/>"#,
                r#"<text x="400" y="220" font-size="40" text-anchor="middle">{}</text>"#,
                r#"<text x="400" y="280" font-size="20" text-anchor="middle">{} &#183; {}</text>"#,
                "</svg>"
            ),
            escape(&request.instance_name),
            escape(&request.definition),
            Utc::now().format("%Y-%m-%d %H:%M UTC"),
        );

        Ok(RenderArtifact {
            content: svg.into_bytes(),
            mime_type: "image/svg+xml".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_placeholder_escapes_names() {
        let request = RenderRequest {
            plugin_instance_id: 1,
            definition: "weather".to_string(),
            instance_name: "Rain & <Shine>".to_string(),
            settings: serde_json::json!({}),
        };

        let artifact = PlaceholderRenderer.render(&request).await.unwrap();
        let svg = String::from_utf8(artifact.content).unwrap();
        assert_eq!(artifact.mime_type, "image/svg+xml");
        assert!(svg.contains("Rain &amp; &lt;Shine&gt;"));
    }
}
