//! The export router: per-destination uploaders behind one capability
//! interface, selected by a project's `DestinationSpec`. Credentials are
//! resolved from the secret store when an uploader is built and live only
//! for one export batch; `close` tears the uploader down.

use deident::AnonymisedStudy;
use models::{DestinationSpec, DicomDestination, ParquetDestination, XnatOptions};
use secrets::{secret_name, SecretError, SecretResolver};
use std::time::Duration;

mod dicomweb;
mod ftps;
mod package;
mod xnat;

pub use dicomweb::DicomWebUploader;
pub use ftps::FtpsUploader;
pub use package::study_zip;
pub use xnat::XnatUploader;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Worth retrying with backoff.
    #[error("transient upload failure: {0}")]
    Transient(String),
    /// Retrying will not help.
    #[error("upload failed: {0}")]
    Permanent(String),
}

impl From<SecretError> for UploadError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::Transport(_) => UploadError::Transient(err.to_string()),
            _ => UploadError::Permanent(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Where the payload landed, destination-specific.
    pub location: String,
    pub bytes: u64,
}

/// One file of a tabular (parquet) extract, path relative to the extract
/// root.
#[derive(Debug, Clone)]
pub struct TabularFile {
    pub relative_path: String,
    pub bytes: Vec<u8>,
}

/// The capability interface every destination implements.
#[async_trait::async_trait]
pub trait Uploader: Send + Sync {
    async fn upload_study(
        &self,
        project: &str,
        study: &AnonymisedStudy,
    ) -> Result<UploadReceipt, UploadError>;

    async fn upload_tabular(
        &self,
        project: &str,
        extract_datetime: &chrono::DateTime<chrono::Utc>,
        files: &[TabularFile],
    ) -> Result<UploadReceipt, UploadError>;

    async fn close(&self) -> Result<(), UploadError>;
}

async fn ftps_from_secrets(
    alias: &str,
    secrets: &dyn SecretResolver,
) -> Result<FtpsUploader, UploadError> {
    let host = secrets.require_str(&secret_name(alias, &["ftps", "host"])).await?;
    let port = secrets
        .require_str(&secret_name(alias, &["ftps", "port"]))
        .await?
        .parse::<u16>()
        .map_err(|_| UploadError::Permanent("ftps port secret is not a number".to_string()))?;
    let username = secrets
        .require_str(&secret_name(alias, &["ftps", "username"]))
        .await?;
    let password = secrets
        .require_str(&secret_name(alias, &["ftps", "password"]))
        .await?;
    Ok(FtpsUploader::new(host, port, username, password))
}

/// Build the DICOM uploader for a project, resolving destination
/// credentials from the secret store. `Ok(None)` means the project exports
/// no DICOM.
pub async fn dicom_uploader_for(
    spec: &DestinationSpec,
    alias: &str,
    secrets: &dyn SecretResolver,
) -> Result<Option<Box<dyn Uploader>>, UploadError> {
    match spec.dicom {
        DicomDestination::None => Ok(None),
        DicomDestination::Ftps => Ok(Some(Box::new(ftps_from_secrets(alias, secrets).await?))),
        DicomDestination::Dicomweb => {
            let endpoint = secrets
                .require_str(&secret_name(alias, &["dicomweb", "url"]))
                .await?;
            let username = secrets
                .require_str(&secret_name(alias, &["dicomweb", "username"]))
                .await?;
            let password = secrets
                .require_str(&secret_name(alias, &["dicomweb", "password"]))
                .await?;
            Ok(Some(Box::new(DicomWebUploader::new(
                endpoint, username, password,
            ))))
        }
        DicomDestination::Xnat => {
            let endpoint = secrets
                .require_str(&secret_name(alias, &["xnat", "url"]))
                .await?;
            let username = secrets
                .require_str(&secret_name(alias, &["xnat", "username"]))
                .await?;
            let password = secrets
                .require_str(&secret_name(alias, &["xnat", "password"]))
                .await?;
            let options = spec.xnat.unwrap_or_else(XnatOptions::default);
            Ok(Some(Box::new(XnatUploader::new(
                endpoint, username, password, options,
            ))))
        }
    }
}

/// Build the tabular uploader for a project. `Ok(None)` when the project
/// exports no tabular data.
pub async fn tabular_uploader_for(
    spec: &DestinationSpec,
    alias: &str,
    secrets: &dyn SecretResolver,
) -> Result<Option<Box<dyn Uploader>>, UploadError> {
    match spec.parquet {
        ParquetDestination::None => Ok(None),
        ParquetDestination::Ftps => Ok(Some(Box::new(ftps_from_secrets(alias, secrets).await?))),
    }
}

/// Run an upload, retrying transient failures with capped backoff.
pub async fn upload_with_retry<F, Fut>(
    max_attempts: u32,
    mut run: F,
) -> Result<UploadReceipt, UploadError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<UploadReceipt, UploadError>>,
{
    let backoff = exponential_backoff::Backoff::new(
        max_attempts,
        Duration::from_millis(500),
        Some(Duration::from_secs(30)),
    );
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run().await {
            Ok(receipt) => return Ok(receipt),
            Err(UploadError::Transient(message)) => match backoff.next(attempt) {
                Some(delay) if attempt < max_attempts => {
                    tracing::warn!(attempt, message, "transient upload failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(UploadError::Permanent(message)),
            },
            Err(err) => return Err(err),
        }
    }
}
