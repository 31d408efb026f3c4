//! Azure key-vault resolver, driven over the vault REST surface with an
//! OAuth2 client-credentials grant. Tokens are cached until shortly before
//! expiry; transient transport failures are retried a bounded number of
//! times before surfacing as `SecretError::Transport`.

use crate::{SecretError, SecretResolver};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

const API_VERSION: &str = "7.4";
const TOKEN_SLACK: Duration = Duration::from_secs(60);
const ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct KeyVaultConfig {
    pub vault_name: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

struct CachedToken {
    token: String,
    expires_at: std::time::Instant,
}

pub struct AzureKeyVault {
    config: KeyVaultConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

impl AzureKeyVault {
    pub fn new(config: KeyVaultConfig) -> Self {
        AzureKeyVault {
            config,
            http: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    fn vault_url(&self, name: &str) -> String {
        format!(
            "https://{}.vault.azure.net/secrets/{}?api-version={}",
            self.config.vault_name, name, API_VERSION
        )
    }

    async fn bearer_token(&self) -> Result<String, SecretError> {
        let mut cached = self.token.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.expires_at > std::time::Instant::now() + TOKEN_SLACK {
                return Ok(entry.token.clone());
            }
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.config.tenant_id
        );
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("scope", "https://vault.azure.net/.default"),
        ];
        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| SecretError::Transport(err.into()))?;
        if !response.status().is_success() {
            return Err(SecretError::Rejected(format!(
                "token request failed with {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| SecretError::Transport(err.into()))?;

        let expires_at = std::time::Instant::now() + Duration::from_secs(token.expires_in);
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn get_once(&self, name: &str) -> Result<Option<Vec<u8>>, SecretError> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(self.vault_url(name))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| SecretError::Transport(err.into()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bundle: SecretBundle = response
                    .json()
                    .await
                    .map_err(|err| SecretError::Transport(err.into()))?;
                Ok(Some(bundle.value.into_bytes()))
            }
            status => Err(SecretError::Rejected(format!(
                "vault returned {status} for {name:?}"
            ))),
        }
    }

    async fn put_once(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
        let token = self.bearer_token().await?;
        let value = std::str::from_utf8(value)
            .map_err(|_| SecretError::Rejected(format!("secret {name:?} is not UTF-8")))?;
        let response = self
            .http
            .put(self.vault_url(name))
            .bearer_auth(token)
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .map_err(|err| SecretError::Transport(err.into()))?;
        if !response.status().is_success() {
            return Err(SecretError::Rejected(format!(
                "vault returned {} storing {name:?}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecretResolver for AzureKeyVault {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretError> {
        let mut last = None;
        for attempt in 1..=ATTEMPTS {
            match self.get_once(name).await {
                Ok(found) => return Ok(found),
                Err(err @ SecretError::Transport(_)) => {
                    tracing::warn!(name, attempt, error = %err, "transient vault failure");
                    last = Some(err);
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| SecretError::Unavailable(name.to_string())))
    }

    async fn put(&self, name: &str, value: &[u8]) -> Result<(), SecretError> {
        let mut last = None;
        for attempt in 1..=ATTEMPTS {
            match self.put_once(name, value).await {
                Ok(()) => return Ok(()),
                Err(err @ SecretError::Transport(_)) => {
                    tracing::warn!(name, attempt, error = %err, "transient vault failure");
                    last = Some(err);
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| SecretError::Unavailable(name.to_string())))
    }
}
