use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use pasta_core::types::types::UploadedChunk;
use pasta_core::uploader::http_uploader::PostUploadHook;

/// Copies the uploaded URLs to the X clipboard through `xclip`.
pub struct ClipboardHook;

#[async_trait]
impl PostUploadHook for ClipboardHook {
    fn name(&self) -> &str {
        "clipboard"
    }

    async fn on_success(&self, uploaded: &[UploadedChunk]) -> Result<(), String> {
        let text = uploaded
            .iter()
            .map(|c| c.url.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut child = Command::new("xclip")
            .args(["-selection", "clipboard"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("cannot run xclip: {}", e))?;

        let mut stdin = child.stdin.take().ok_or("xclip stdin unavailable")?;
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| format!("cannot write to xclip: {}", e))?;
        drop(stdin);

        let status = child.wait().await.map_err(|e| e.to_string())?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("xclip exited with {}", status))
        }
    }
}
