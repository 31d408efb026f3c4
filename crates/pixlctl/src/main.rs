//! `pixl`: operator surface of the imaging extraction pipeline.

use anyhow::Context;
use clap::{Parser, Subcommand};
use models::{DestinationSpec, XnatOptions};
use scheduler::{Runtime, SecretBackedUploaders, Settings, UploaderFactory};
use secrets::SecretResolver;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use stores::{DicomStore, HttpStore};
use tokio_util::sync::CancellationToken;

mod logging;
mod populate;
mod settings;

use settings::CoreSettings;

#[derive(Debug, Parser)]
#[command(name = "pixl", about = "Imaging extract, anonymise and export pipeline", version)]
struct Cli {
    #[command(flatten)]
    log: logging::LogArgs,

    #[command(flatten)]
    settings: CoreSettings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue extract requests from a CSV file or an OMOP extract
    /// directory.
    Populate {
        path: PathBuf,
        /// Queue priority for the published messages (1 lowest, 5 highest).
        #[arg(long, default_value_t = 1)]
        priority: u8,
    },
    /// Consume the imaging queues until signalled to stop.
    Start,
    /// Signal a running `start` daemon to drain and exit.
    Stop,
    /// Print queue depths and per-project export tallies.
    Status,
    /// Upload the tabular (parquet) part of an extract to the project's
    /// configured destination.
    ExportPatientData { path: PathBuf },
}

/// A configuration problem: exit code 1 instead of 2.
#[derive(Debug)]
struct ConfigProblem(String);

impl std::fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigProblem {}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(&cli.log);

    match run(cli).await {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            if is_config_error(&err) {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<registry::ConfigError>().is_some()
            || cause.downcast_ref::<ConfigProblem>().is_some()
    })
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Populate { ref path, priority } => populate_command(&cli, path, priority).await,
        Command::Start => start_command(&cli).await,
        Command::Stop => stop_command(&cli),
        Command::Status => status_command(&cli).await,
        Command::ExportPatientData { ref path } => export_patient_data(&cli, path).await,
    }
}

async fn populate_command(cli: &Cli, path: &Path, priority: u8) -> anyhow::Result<()> {
    let priority = models::Priority::new(priority)
        .map_err(ConfigProblem)
        .context("invalid --priority")?;
    let messages = populate::load_messages(path, priority)?;
    if messages.is_empty() {
        println!("nothing to publish");
        return Ok(());
    }

    let broker = queue::Broker::connect(&cli.settings.broker.config())
        .await
        .context("connecting to the message broker")?;
    for message in &messages {
        broker.publish(queue::PRIMARY_QUEUE, message).await?;
    }
    println!("published {} messages to {}", messages.len(), queue::PRIMARY_QUEUE);
    Ok(())
}

fn build_secrets(cli: &Cli) -> anyhow::Result<Arc<dyn SecretResolver>> {
    let s = &cli.settings.secrets;
    let base: Arc<dyn SecretResolver> = match (&s.vault_name, &s.tenant_id, &s.client_id, &s.client_secret) {
        (Some(vault), Some(tenant), Some(client), Some(secret)) => {
            Arc::new(secrets::AzureKeyVault::new(secrets::KeyVaultConfig {
                vault_name: vault.clone(),
                tenant_id: tenant.clone(),
                client_id: client.clone(),
                client_secret: secret.clone(),
            }))
        }
        (None, None, None, None) => {
            tracing::info!(
                dir = %s.secrets_dir.display(),
                "no key vault configured, using the local secret directory",
            );
            Arc::new(secrets::LocalSecrets::new(&s.secrets_dir))
        }
        _ => anyhow::bail!(ConfigProblem(
            "AZURE_KEY_VAULT_NAME, AZURE_TENANT_ID, AZURE_CLIENT_ID and AZURE_CLIENT_SECRET must be set together".to_string()
        )),
    };

    Ok(match &cli.settings.salt_value {
        Some(value) => Arc::new(secrets::FixedSaltOverride::new(
            base,
            value.clone().into_bytes(),
        )),
        None => base,
    })
}

/// Applies the environment's XNAT defaults to projects that set none.
struct XnatDefaultingFactory {
    inner: SecretBackedUploaders,
    defaults: Option<XnatOptions>,
}

#[async_trait::async_trait]
impl UploaderFactory for XnatDefaultingFactory {
    async fn dicom_uploader(
        &self,
        spec: &DestinationSpec,
        alias: &str,
    ) -> Result<Option<Box<dyn export::Uploader>>, export::UploadError> {
        let mut spec = *spec;
        if spec.xnat.is_none() {
            spec.xnat = self.defaults;
        }
        self.inner.dicom_uploader(&spec, alias).await
    }

    async fn tabular_uploader(
        &self,
        spec: &DestinationSpec,
        alias: &str,
    ) -> Result<Option<Box<dyn export::Uploader>>, export::UploadError> {
        self.inner.tabular_uploader(spec, alias).await
    }
}

async fn build_runtime(cli: &Cli) -> anyhow::Result<Arc<Runtime>> {
    let s = &cli.settings;
    let registry = Arc::new(registry::Registry::load(&s.project_configs_dir)?);
    let secrets = build_secrets(cli)?;

    let pool = ledger::connect(&s.database.dsn(), s.skip_migrations)
        .await
        .context("connecting to the export ledger database")?;
    let ledger: Arc<dyn ledger::Ledger> = Arc::new(ledger::PgLedger::new(pool));

    let raw_store: Arc<dyn DicomStore> = Arc::new(HttpStore::new(s.stores.raw_config()));
    let staging: Arc<dyn DicomStore> = Arc::new(HttpStore::new(s.stores.anon_config()));

    let mut cache_config = cache::CacheConfig::default();
    cache_config.max_storage_mb = s.raw_maximum_storage_mb;
    cache_config.stable_poll =
        std::time::Duration::from_secs(s.raw_stable_seconds.clamp(1, 30));
    cache_config.stable_wait_timeout = s.transfer_timeout();
    let raw_cache = Arc::new(cache::RawCache::new(raw_store.clone(), cache_config));

    let source_config = |kind, modality: &str| {
        let mut config = sources::SourceConfig::new(kind, modality);
        config.query_timeout = s.query_timeout();
        config.transfer_timeout = s.transfer_timeout();
        config
    };
    let primary = Arc::new(sources::SourceClient::new(
        raw_store.clone(),
        source_config(models::SourceKind::Primary, &s.stores.primary_modality),
    ));
    let secondary = Arc::new(sources::SourceClient::new(
        raw_store,
        source_config(models::SourceKind::Secondary, &s.stores.secondary_modality),
    ));

    let limits = Arc::new(limits::Limits::new(
        s.max_messages_in_flight,
        s.concurrent_jobs,
        limits::RateParams::new(s.source_rate, s.source_burst),
    ));

    let uploaders = Arc::new(XnatDefaultingFactory {
        inner: SecretBackedUploaders::new(secrets.clone()),
        defaults: s.xnat.defaults().map_err(|err| ConfigProblem(err.to_string()))?,
    });

    Ok(Arc::new(Runtime {
        registry,
        ledger,
        limits,
        raw_cache,
        primary,
        secondary,
        staging,
        secrets,
        uploaders,
        settings: Settings {
            org_root: s.org_root.clone(),
            forced_offset_days: s.study_time_offset,
            upload_attempts: 3,
            shutdown_grace: s.shutdown_grace(),
            requeue_delay: s.requeue_delay(),
        },
    }))
}

async fn start_command(cli: &Cli) -> anyhow::Result<()> {
    let rt = build_runtime(cli).await?;
    let broker = Arc::new(
        queue::Broker::connect(&cli.settings.broker.config())
            .await
            .context("connecting to the message broker")?,
    );

    let pid_file = cli.settings.pid_file.clone();
    std::fs::write(&pid_file, std::process::id().to_string())
        .with_context(|| format!("writing pidfile {}", pid_file.display()))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(rt.clone(), shutdown.clone());

    let served = scheduler::serve(rt, broker, shutdown).await;
    let _ = std::fs::remove_file(&pid_file);
    served
}

fn spawn_signal_handlers(rt: Arc<Runtime>, shutdown: CancellationToken) {
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("caught interrupt; draining");
                shutdown.cancel();
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let Ok(mut term) = signal(SignalKind::terminate()) else {
                    return;
                };
                term.recv().await;
                tracing::info!("caught SIGTERM; draining");
                shutdown.cancel();
            }
        });

        // SIGHUP reloads project configuration and rate parameters.
        tokio::spawn(async move {
            let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                return;
            };
            while hangup.recv().await.is_some() {
                if let Err(err) = rt.registry.reload() {
                    tracing::error!(error = %err, "configuration reload failed, keeping previous");
                }
                let rate = read_env_f64("PIXL_SOURCE_RATE");
                let burst = read_env_f64("PIXL_SOURCE_BURST");
                if let (Some(rate), Some(burst)) = (rate, burst) {
                    let params = limits::RateParams::new(rate, burst);
                    rt.limits.reload(models::SourceKind::Primary, params).await;
                    rt.limits.reload(models::SourceKind::Secondary, params).await;
                }
            }
        });
    }
}

fn read_env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn stop_command(cli: &Cli) -> anyhow::Result<()> {
    let pid_file = &cli.settings.pid_file;
    let raw = std::fs::read_to_string(pid_file)
        .with_context(|| format!("reading pidfile {}", pid_file.display()))?;
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("pidfile {} holds no pid", pid_file.display()))?;

    #[cfg(unix)]
    {
        // SAFETY: sending a signal to a pid has no memory-safety concerns.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            anyhow::bail!("failed to signal pid {pid}: {}", std::io::Error::last_os_error());
        }
        println!("signalled pid {pid} to drain");
        Ok(())
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("stop is only supported on unix hosts")
    }
}

async fn status_command(cli: &Cli) -> anyhow::Result<()> {
    let broker = queue::Broker::connect(&cli.settings.broker.config())
        .await
        .context("connecting to the message broker")?;
    for name in [
        queue::PRIMARY_QUEUE,
        queue::SECONDARY_QUEUE,
        queue::DEAD_LETTER_QUEUE,
    ] {
        println!("{name}: {} messages", broker.depth(name).await?);
    }

    let pool = ledger::connect(&cli.settings.database.dsn(), true)
        .await
        .context("connecting to the export ledger database")?;
    let ledger = ledger::PgLedger::new(pool);
    let counts = ledger::Ledger::counts(&ledger).await?;
    if counts.is_empty() {
        println!("no export activity recorded");
        return Ok(());
    }
    println!("{:<24} {:>8} {:>10} {:>8} {:>8}", "project", "pending", "anonymised", "exported", "failed");
    for c in counts {
        println!(
            "{:<24} {:>8} {:>10} {:>8} {:>8}",
            c.project_slug, c.pending, c.anonymised, c.exported, c.failed
        );
    }
    Ok(())
}

async fn export_patient_data(cli: &Cli, path: &Path) -> anyhow::Result<()> {
    let summary = populate::read_summary(path)?;
    let registry = registry::Registry::load(&cli.settings.project_configs_dir)?;
    let project = registry.project(&summary.project_name)?;
    let spec = project.destination();

    let secrets = build_secrets(cli)?;
    let factory = SecretBackedUploaders::new(secrets);
    let Some(uploader) = factory.tabular_uploader(&spec, &project.kv_alias).await.map_err(|err| anyhow::anyhow!(err.to_string()))? else {
        println!("project {} has no tabular destination; nothing to do", project.slug);
        return Ok(());
    };

    let mut files = Vec::new();
    gather_extract_files(path, path, &mut files)?;
    anyhow::ensure!(!files.is_empty(), "no parquet files under {}", path.display());

    let receipt = export::upload_with_retry(3, || {
        uploader.upload_tabular(&project.slug, &summary.extract_datetime, &files)
    })
    .await
    .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    uploader.close().await.ok();

    println!(
        "uploaded {} files ({} bytes) to {}",
        files.len(),
        receipt.bytes,
        receipt.location
    );
    Ok(())
}

fn gather_extract_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<export::TabularFile>,
) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            gather_extract_files(root, &path, out)?;
            continue;
        }
        let wanted = path.extension().and_then(|e| e.to_str()) == Some("parquet")
            || path.file_name().and_then(|n| n.to_str()) == Some("extract_summary.json");
        if !wanted {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .expect("children stay under the root")
            .to_string_lossy()
            .replace('\\', "/");
        out.push(export::TabularFile {
            relative_path: relative,
            bytes: std::fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?,
        });
    }
    Ok(())
}
