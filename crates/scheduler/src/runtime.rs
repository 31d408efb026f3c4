use cache::RawCache;
use export::{UploadError, Uploader};
use ledger::Ledger;
use limits::Limits;
use models::{DestinationSpec, SourceKind};
use registry::Registry;
use secrets::SecretResolver;
use sources::SourceClient;
use std::sync::Arc;
use std::time::Duration;
use stores::DicomStore;

/// Scheduler-wide settings with no better home than the runtime itself.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Organisational UID root for regenerated UIDs.
    pub org_root: String,
    /// Pins the date-shift offset for every study (`STUDY_TIME_OFFSET`).
    pub forced_offset_days: Option<i64>,
    /// Attempts per upload before the failure becomes permanent.
    pub upload_attempts: u32,
    /// How long a drain waits for in-flight messages.
    pub shutdown_grace: Duration,
    /// Pause before a transient failure is negative-acked for redelivery,
    /// so a persistently-failing message backs off instead of spinning.
    /// First deliveries wait this long; redeliveries wait a multiple of it.
    pub requeue_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            org_root: "1.2.826.0.1.3680043.10.888".to_string(),
            forced_offset_days: None,
            upload_attempts: 3,
            shutdown_grace: Duration::from_secs(30),
            requeue_delay: Duration::from_secs(5),
        }
    }
}

/// Builds uploaders per project at export time. Tests swap in mocks; the
/// production implementation resolves credentials from the secret store.
#[async_trait::async_trait]
pub trait UploaderFactory: Send + Sync {
    async fn dicom_uploader(
        &self,
        spec: &DestinationSpec,
        alias: &str,
    ) -> Result<Option<Box<dyn Uploader>>, UploadError>;

    async fn tabular_uploader(
        &self,
        spec: &DestinationSpec,
        alias: &str,
    ) -> Result<Option<Box<dyn Uploader>>, UploadError>;
}

pub struct SecretBackedUploaders {
    secrets: Arc<dyn SecretResolver>,
}

impl SecretBackedUploaders {
    pub fn new(secrets: Arc<dyn SecretResolver>) -> Self {
        SecretBackedUploaders { secrets }
    }
}

#[async_trait::async_trait]
impl UploaderFactory for SecretBackedUploaders {
    async fn dicom_uploader(
        &self,
        spec: &DestinationSpec,
        alias: &str,
    ) -> Result<Option<Box<dyn Uploader>>, UploadError> {
        export::dicom_uploader_for(spec, alias, self.secrets.as_ref()).await
    }

    async fn tabular_uploader(
        &self,
        spec: &DestinationSpec,
        alias: &str,
    ) -> Result<Option<Box<dyn Uploader>>, UploadError> {
        export::tabular_uploader_for(spec, alias, self.secrets.as_ref()).await
    }
}

/// Every collaborator the scheduler touches, threaded explicitly. Tests
/// construct one with in-memory stores, ledger, secret resolver and
/// uploaders; production wiring lives in the CLI.
pub struct Runtime {
    pub registry: Arc<Registry>,
    pub ledger: Arc<dyn Ledger>,
    pub limits: Arc<Limits>,
    pub raw_cache: Arc<RawCache>,
    pub primary: Arc<SourceClient>,
    pub secondary: Arc<SourceClient>,
    pub staging: Arc<dyn DicomStore>,
    pub secrets: Arc<dyn SecretResolver>,
    pub uploaders: Arc<dyn UploaderFactory>,
    pub settings: Settings,
}

impl Runtime {
    pub fn source(&self, kind: SourceKind) -> &Arc<SourceClient> {
        match kind {
            SourceKind::Primary => &self.primary,
            SourceKind::Secondary => &self.secondary,
        }
    }
}
