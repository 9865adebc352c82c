//! Binary attachment transfer over presigned URLs.
//!
//! Presigned URLs grant direct blob access without the platform API key, so
//! this client deliberately carries no default headers. Downloads stream to
//! per-worker temp files rather than memory; `NamedTempFile` removes them on
//! drop, covering every exit path including errors. Uploads stream the temp
//! file back out with the correct MIME type.

use std::io::Write;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio_util::io::ReaderStream;

use crate::errors::MigrateError;

/// Blob transfers get a longer timeout than JSON calls.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Fallback MIME type when the source exposes none.
const OCTET_STREAM: &str = "application/octet-stream";

/// An attachment downloaded from the source, staged on disk and ready for
/// upload. The temp file is removed when the value drops.
pub struct StagedAttachment {
    /// Destination attachment key; the inbound `attachment.<name>` prefix is
    /// stripped so file extensions survive.
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub file: NamedTempFile,
}

/// Strip the `attachment.` envelope prefix from an inbound key.
pub fn display_name(key: &str) -> String {
    key.strip_prefix("attachment.").unwrap_or(key).to_string()
}

/// Bare HTTP client for presigned blob URLs.
pub struct AttachmentClient {
    http: reqwest::Client,
}

impl AttachmentClient {
    pub fn new(verify_tls: bool) -> Result<Self, MigrateError> {
        let http = reqwest::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| MigrateError::Network(e.to_string()))?;
        Ok(Self { http })
    }

    /// Stage one attachment described by the source's `attachment_urls`
    /// entry. Returns `None` when the entry carries no presigned URL.
    pub async fn stage(
        &self,
        key: &str,
        info: &Value,
    ) -> Result<Option<StagedAttachment>, MigrateError> {
        let Some(url) = info.get("presigned_url").and_then(Value::as_str) else {
            tracing::warn!("attachment '{}' has no presigned URL, skipping", key);
            return Ok(None);
        };
        let mime_type = info
            .get("mime_type")
            .or_else(|| info.get("content_type"))
            .and_then(Value::as_str)
            .unwrap_or(OCTET_STREAM)
            .to_string();

        let (file, size) = self.download_to_temp(url).await?;
        tracing::debug!("downloaded attachment '{}' ({} bytes)", key, size);

        Ok(Some(StagedAttachment {
            name: display_name(key),
            mime_type,
            size,
            file,
        }))
    }

    /// Stream a presigned GET into a fresh temp file.
    pub async fn download_to_temp(&self, url: &str) -> Result<(NamedTempFile, u64), MigrateError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MigrateError::Server {
                endpoint: "presigned download".to_string(),
                status: status.as_u16(),
                detail: format!("blob download returned {status}"),
            });
        }

        let mut file = NamedTempFile::new()?;
        let mut size: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MigrateError::Network(e.to_string()))?;
            file.write_all(&chunk)?;
            size += chunk.len() as u64;
        }
        file.flush()?;
        Ok((file, size))
    }

    /// Stream a staged file to a presigned PUT with its MIME type.
    pub async fn upload(
        &self,
        url: &str,
        attachment: &StagedAttachment,
    ) -> Result<(), MigrateError> {
        let file = tokio::fs::File::open(attachment.file.path()).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .http
            .put(url)
            .header("Content-Type", attachment.mime_type.clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MigrateError::Server {
                endpoint: "presigned upload".to_string(),
                status: status.as_u16(),
                detail: format!("blob upload returned {status}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_strips_envelope_prefix() {
        assert_eq!(display_name("attachment.report.pdf"), "report.pdf");
        assert_eq!(display_name("report.pdf"), "report.pdf");
        // Only the envelope prefix is stripped, not interior occurrences.
        assert_eq!(
            display_name("attachment.attachment.x"),
            "attachment.x"
        );
    }
}
