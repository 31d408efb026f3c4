//! Secret resolution for project salts and destination credentials.
//!
//! Secrets are named `<alias>--<suffix>` under a project's key-vault alias,
//! e.g. `myproject--salt` or `myproject--dicomweb--password`. Salts are
//! created on first use: a missing salt is generated (64 random bytes),
//! stored under the same name, then returned.

use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;

mod keyvault;
pub use keyvault::{AzureKeyVault, KeyVaultConfig};

pub const SALT_SUFFIX: &str = "salt";
const SALT_BYTES: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {0:?} is unavailable")]
    Unavailable(String),
    #[error("failed to reach secret store")]
    Transport(#[source] anyhow::Error),
    #[error("secret store rejected the request: {0}")]
    Rejected(String),
}

/// Compose the stored name of a secret under a project alias.
pub fn secret_name(alias: &str, parts: &[&str]) -> String {
    let mut name = alias.to_string();
    for part in parts {
        name.push_str("--");
        name.push_str(part);
    }
    name
}

#[async_trait::async_trait]
pub trait SecretResolver: Send + Sync {
    /// Fetch a secret by its full stored name, `None` when absent.
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretError>;

    /// Store a secret under its full name, overwriting any prior value.
    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError>;

    /// The project salt for `alias`, created on first use.
    async fn salt(&self, alias: &str) -> Result<Vec<u8>, SecretError> {
        let name = secret_name(alias, &[SALT_SUFFIX]);
        if let Some(value) = self.get(&name).await? {
            return base64::decode(&value)
                .map_err(|_| SecretError::Rejected(format!("salt {name:?} is not base64")));
        }

        let mut salt = vec![0u8; SALT_BYTES];
        rand::thread_rng().fill_bytes(&mut salt);
        self.put(&name, base64::encode(&salt).as_bytes()).await?;
        tracing::info!(alias, "created project salt on first use");
        Ok(salt)
    }

    /// A required secret: absent names are an error.
    async fn require(&self, name: &str) -> Result<Vec<u8>, SecretError> {
        self.get(name)
            .await?
            .ok_or_else(|| SecretError::Unavailable(name.to_string()))
    }

    /// A required secret as UTF-8 text, trimmed of trailing newlines.
    async fn require_str(&self, name: &str) -> Result<String, SecretError> {
        let bytes = self.require(name).await?;
        String::from_utf8(bytes)
            .map(|s| s.trim_end_matches(['\r', '\n']).to_string())
            .map_err(|_| SecretError::Rejected(format!("secret {name:?} is not UTF-8")))
    }
}

/// Directory-backed resolver: one file per secret. Serves development and
/// tests; never use against production credentials.
pub struct LocalSecrets {
    dir: PathBuf,
}

impl LocalSecrets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        LocalSecrets { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, SecretError> {
        // Secret names are flat; reject anything that would escape the dir.
        if name.contains(['/', '\\']) || name.contains("..") {
            return Err(SecretError::Rejected(format!(
                "invalid secret name {name:?}"
            )));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait::async_trait]
impl SecretResolver for LocalSecrets {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretError> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SecretError::Transport(err.into())),
        }
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
        let path = self.path_for(name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| SecretError::Transport(err.into()))?;
        tokio::fs::write(&path, value)
            .await
            .map_err(|err| SecretError::Transport(err.into()))
    }
}

/// Wraps another resolver, overriding every project salt with a fixed value.
/// Backs the `SALT_VALUE` escape hatch for reproducible local runs.
pub struct FixedSaltOverride {
    inner: Arc<dyn SecretResolver>,
    salt: Vec<u8>,
}

impl FixedSaltOverride {
    pub fn new(inner: Arc<dyn SecretResolver>, salt: Vec<u8>) -> Self {
        FixedSaltOverride { inner, salt }
    }
}

#[async_trait::async_trait]
impl SecretResolver for FixedSaltOverride {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretError> {
        if name.ends_with(&format!("--{SALT_SUFFIX}")) {
            return Ok(Some(base64::encode(&self.salt).into_bytes()));
        }
        self.inner.get(name).await
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
        self.inner.put(name, value).await
    }
}
