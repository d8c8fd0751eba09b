use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::RenderError;

/// Render-to-image collaborator: turns an absolute URL into raster image
/// bytes of the page at a fixed viewport. Injected into the pipeline so
/// tests can substitute a canned rasterizer.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<Vec<u8>, RenderError>;
}

/// `wkhtmltoimage` subprocess renderer. JPEG output keeps the capture small
/// enough that render latency, not decode, dominates a scan.
pub struct WkHtmlToImage {
    viewport_height: u32,
    timeout: Duration,
}

impl WkHtmlToImage {
    pub fn new(viewport_height: u32, timeout: Duration) -> Self {
        Self {
            viewport_height,
            timeout,
        }
    }

    /// Probes the installed binary; the proxy refuses to start without it.
    pub async fn probe_version() -> Result<String, RenderError> {
        let output = Command::new("wkhtmltoimage")
            .arg("-V")
            .stdin(Stdio::null())
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.replace("wkhtmltoimage", "").trim().to_string())
    }
}

#[async_trait]
impl Renderer for WkHtmlToImage {
    async fn render(&self, url: &str) -> Result<Vec<u8>, RenderError> {
        debug!(url, "rendering page");
        let child = Command::new("wkhtmltoimage")
            .arg("-q")
            .arg("--height")
            .arg(self.viewport_height.to_string())
            .arg("-f")
            .arg("jpeg")
            .arg(url)
            .arg("/dev/stdout")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::Failed(format!(
                "{} ({})",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}
