//! DICOMweb (STOW-RS) uploader: one multipart/related POST per study.

use crate::{TabularFile, UploadError, UploadReceipt, Uploader};
use deident::AnonymisedStudy;

const BOUNDARY: &str = "pixl-stow-boundary";

pub struct DicomWebUploader {
    endpoint: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl DicomWebUploader {
    pub fn new(endpoint: String, username: String, password: String) -> Self {
        DicomWebUploader {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username,
            password,
            client: reqwest::Client::new(),
        }
    }
}

/// Render `application/dicom` parts into one multipart/related body.
fn multipart_body(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/dicom\r\n");
        body.extend_from_slice(format!("Content-Length: {}\r\n", part.len()).as_bytes());
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(part);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--").as_bytes());
    body
}

#[async_trait::async_trait]
impl Uploader for DicomWebUploader {
    async fn upload_study(
        &self,
        project: &str,
        study: &AnonymisedStudy,
    ) -> Result<UploadReceipt, UploadError> {
        let parts: Vec<Vec<u8>> = study.instances.iter().map(|i| i.bytes.clone()).collect();
        let body = multipart_body(&parts);
        let size = body.len() as u64;
        let url = format!("{}/studies", self.endpoint);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; type=\"application/dicom\"; boundary={BOUNDARY}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|err| UploadError::Transient(format!("stow-rs: {err}")))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(
                project,
                url,
                instances = study.instances.len(),
                "stored study via STOW-RS",
            );
            Ok(UploadReceipt {
                location: url,
                bytes: size,
            })
        } else if status.is_server_error() {
            Err(UploadError::Transient(format!("stow-rs returned {status}")))
        } else {
            Err(UploadError::Permanent(format!("stow-rs returned {status}")))
        }
    }

    async fn upload_tabular(
        &self,
        _project: &str,
        _extract_datetime: &chrono::DateTime<chrono::Utc>,
        _files: &[TabularFile],
    ) -> Result<UploadReceipt, UploadError> {
        Err(UploadError::Permanent(
            "DICOMweb destinations do not accept tabular extracts".to_string(),
        ))
    }

    async fn close(&self) -> Result<(), UploadError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn multipart_bodies_delimit_every_part() {
        let body = multipart_body(&[b"AAAA".to_vec(), b"BB".to_vec()]);
        let text = String::from_utf8_lossy(&body);

        assert_eq!(text.matches("--pixl-stow-boundary\r\n").count(), 2);
        assert!(text.contains("Content-Type: application/dicom"));
        assert!(text.contains("Content-Length: 4"));
        assert!(text.contains("Content-Length: 2"));
        assert!(text.ends_with("--pixl-stow-boundary--"));
    }
}
