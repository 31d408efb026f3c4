//! Environment-driven settings recognised by the core, grouped by the
//! collaborator they configure. Every value is overridable on the command
//! line; the environment names match the containerised deployment.

use models::{XnatDestination, XnatOptions, XnatOverwrite};
use queue::BrokerConfig;
use std::path::PathBuf;
use std::time::Duration;
use stores::HttpStoreConfig;

#[derive(Debug, clap::Args)]
pub struct CoreSettings {
    /// Directory of per-project YAML configuration.
    #[arg(long, env = "PIXL_PROJECT_CONFIGS_DIR", default_value = "projects")]
    pub project_configs_dir: PathBuf,

    /// Ceiling on concurrently-processing messages (and broker prefetch).
    #[arg(long, env = "PIXL_MAX_MESSAGES_IN_FLIGHT", default_value_t = 10)]
    pub max_messages_in_flight: usize,

    /// Ceiling on concurrent jobs against one DICOM source.
    #[arg(long, env = "ORTHANC_CONCURRENT_JOBS", default_value_t = 5)]
    pub concurrent_jobs: usize,

    /// C-FIND timeout, seconds.
    #[arg(long, env = "PIXL_QUERY_TIMEOUT", default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// C-MOVE timeout, seconds.
    #[arg(long, env = "PIXL_DICOM_TRANSFER_TIMEOUT", default_value_t = 600)]
    pub transfer_timeout_secs: u64,

    /// Token-bucket refill rate per source, requests per second.
    #[arg(long, env = "PIXL_SOURCE_RATE", default_value_t = 5.0)]
    pub source_rate: f64,

    /// Token-bucket burst size per source.
    #[arg(long, env = "PIXL_SOURCE_BURST", default_value_t = 5.0)]
    pub source_burst: f64,

    /// Raw cache byte ceiling in MB; 0 disables eviction.
    #[arg(long, env = "ORTHANC_RAW_MAXIMUM_STORAGE_SIZE", default_value_t = 0)]
    pub raw_maximum_storage_mb: u64,

    /// Quiescence window the raw store applies before a study is stable,
    /// seconds; bounds how often stability is polled.
    #[arg(long, env = "ORTHANC_RAW_STABLE_SECONDS", default_value_t = 60)]
    pub raw_stable_seconds: u64,

    /// Skip ledger schema migrations at startup.
    #[arg(long, env = "SKIP_ALEMBIC", default_value_t = false)]
    pub skip_migrations: bool,

    /// Pin the date-shift offset (days) for every study; testing only.
    #[arg(long, env = "STUDY_TIME_OFFSET")]
    pub study_time_offset: Option<i64>,

    /// Override every project salt with a fixed value; testing only.
    #[arg(long, env = "SALT_VALUE")]
    pub salt_value: Option<String>,

    /// Organisational UID root for regenerated UIDs.
    #[arg(
        long,
        env = "PIXL_ORG_ROOT",
        default_value = "1.2.826.0.1.3680043.10.888"
    )]
    pub org_root: String,

    /// Grace window for draining in-flight messages at shutdown, seconds.
    #[arg(long, env = "PIXL_SHUTDOWN_GRACE", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Pause before a transiently-failed message is requeued, seconds.
    #[arg(long, env = "PIXL_REQUEUE_DELAY", default_value_t = 5)]
    pub requeue_delay_secs: u64,

    /// Where `start` records its pid for `stop`.
    #[arg(long, env = "PIXL_PID_FILE", default_value = "pixl.pid")]
    pub pid_file: PathBuf,

    #[command(flatten)]
    pub broker: BrokerSettings,

    #[command(flatten)]
    pub database: DatabaseSettings,

    #[command(flatten)]
    pub stores: StoreSettings,

    #[command(flatten)]
    pub xnat: XnatSettings,

    #[command(flatten)]
    pub secrets: SecretSettings,
}

impl CoreSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }
}

#[derive(Debug, clap::Args)]
pub struct BrokerSettings {
    #[arg(long = "rabbitmq-host", env = "RABBITMQ_HOST", default_value = "localhost")]
    pub host: String,
    #[arg(long = "rabbitmq-port", env = "RABBITMQ_PORT", default_value_t = 5672)]
    pub port: u16,
    #[arg(long = "rabbitmq-username", env = "RABBITMQ_USERNAME", default_value = "guest")]
    pub username: String,
    #[arg(long = "rabbitmq-password", env = "RABBITMQ_PASSWORD", default_value = "guest")]
    pub password: String,
    #[arg(long = "rabbitmq-vhost", env = "RABBITMQ_VHOST", default_value = "/")]
    pub vhost: String,
}

impl BrokerSettings {
    pub fn config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct DatabaseSettings {
    #[arg(long = "db-host", env = "PIXL_DB_HOST", default_value = "localhost")]
    pub host: String,
    #[arg(long = "db-port", env = "PIXL_DB_PORT", default_value_t = 5432)]
    pub port: u16,
    #[arg(long = "db-name", env = "PIXL_DB_NAME", default_value = "pixl")]
    pub name: String,
    #[arg(long = "db-user", env = "PIXL_DB_USER", default_value = "pixl")]
    pub user: String,
    #[arg(long = "db-password", env = "PIXL_DB_PASSWORD", default_value = "pixl")]
    pub password: String,
}

impl DatabaseSettings {
    pub fn dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, clap::Args)]
pub struct StoreSettings {
    #[arg(long, env = "ORTHANC_RAW_URL", default_value = "http://localhost:8042")]
    pub orthanc_raw_url: url::Url,
    #[arg(long, env = "ORTHANC_RAW_USERNAME", default_value = "orthanc")]
    pub orthanc_raw_username: String,
    #[arg(long, env = "ORTHANC_RAW_PASSWORD", default_value = "orthanc")]
    pub orthanc_raw_password: String,
    #[arg(long, env = "ORTHANC_RAW_AE_TITLE", default_value = "PIXLRAW")]
    pub orthanc_raw_ae_title: String,

    #[arg(long, env = "ORTHANC_ANON_URL", default_value = "http://localhost:8043")]
    pub orthanc_anon_url: url::Url,
    #[arg(long, env = "ORTHANC_ANON_USERNAME", default_value = "orthanc")]
    pub orthanc_anon_username: String,
    #[arg(long, env = "ORTHANC_ANON_PASSWORD", default_value = "orthanc")]
    pub orthanc_anon_password: String,
    #[arg(long, env = "ORTHANC_ANON_AE_TITLE", default_value = "PIXLANON")]
    pub orthanc_anon_ae_title: String,

    /// Modality alias of the first-attempt DICOM source on the raw store.
    #[arg(long, env = "PRIMARY_DICOM_SOURCE_MODALITY", default_value = "PRIMARY")]
    pub primary_modality: String,
    /// Modality alias of the fallback DICOM source on the raw store.
    #[arg(long, env = "SECONDARY_DICOM_SOURCE_MODALITY", default_value = "SECONDARY")]
    pub secondary_modality: String,
}

impl StoreSettings {
    pub fn raw_config(&self) -> HttpStoreConfig {
        HttpStoreConfig {
            base_url: self.orthanc_raw_url.clone(),
            username: self.orthanc_raw_username.clone(),
            password: self.orthanc_raw_password.clone(),
            local_aet: self.orthanc_raw_ae_title.clone(),
        }
    }

    pub fn anon_config(&self) -> HttpStoreConfig {
        HttpStoreConfig {
            base_url: self.orthanc_anon_url.clone(),
            username: self.orthanc_anon_username.clone(),
            password: self.orthanc_anon_password.clone(),
            local_aet: self.orthanc_anon_ae_title.clone(),
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct XnatSettings {
    /// Default XNAT overwrite policy for projects that don't set one:
    /// none|append|delete.
    #[arg(long, env = "XNAT_OVERWRITE")]
    pub xnat_overwrite: Option<String>,
    /// Default XNAT import destination: archive|prearchive.
    #[arg(long, env = "XNAT_DESTINATION")]
    pub xnat_destination: Option<String>,
}

impl XnatSettings {
    pub fn defaults(&self) -> anyhow::Result<Option<XnatOptions>> {
        if self.xnat_overwrite.is_none() && self.xnat_destination.is_none() {
            return Ok(None);
        }
        let fallback = XnatOptions::default();
        let overwrite = match self.xnat_overwrite.as_deref() {
            None => fallback.overwrite,
            Some("none") => XnatOverwrite::None,
            Some("append") => XnatOverwrite::Append,
            Some("delete") => XnatOverwrite::Delete,
            Some(other) => anyhow::bail!("XNAT_OVERWRITE must be none|append|delete, got {other:?}"),
        };
        let destination = match self.xnat_destination.as_deref() {
            None => fallback.destination,
            Some("archive") => XnatDestination::Archive,
            Some("prearchive") => XnatDestination::Prearchive,
            Some(other) => {
                anyhow::bail!("XNAT_DESTINATION must be archive|prearchive, got {other:?}")
            }
        };
        Ok(Some(XnatOptions {
            overwrite,
            destination,
        }))
    }
}

#[derive(Debug, clap::Args)]
pub struct SecretSettings {
    /// Azure key-vault name; unset falls back to the local directory store.
    #[arg(long, env = "AZURE_KEY_VAULT_NAME")]
    pub vault_name: Option<String>,
    #[arg(long, env = "AZURE_TENANT_ID")]
    pub tenant_id: Option<String>,
    #[arg(long, env = "AZURE_CLIENT_ID")]
    pub client_id: Option<String>,
    #[arg(long, env = "AZURE_CLIENT_SECRET")]
    pub client_secret: Option<String>,
    /// Directory-backed secret store for development and tests.
    #[arg(long, env = "PIXL_SECRETS_DIR", default_value = ".secrets")]
    pub secrets_dir: PathBuf,
}
