//! # Connect REST Client
//!
//! Service-account access to the secret store via a 1Password Connect-style
//! REST API.
//!
//! Vaults and items may be addressed by id or by name/title; name lookups go
//! through the list endpoints and are cached for the duration of the run so
//! a config with many fields in one item does not re-list on every fetch.
//!
//! Status mapping: 401/403 become [`FetchError::PermissionDenied`], 404
//! becomes [`FetchError::NotFound`], transport failures and server errors
//! become [`FetchError::Unavailable`] (the retryable class).

use crate::config::VaultRef;
use crate::store::{FetchError, SecretStore};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// REST client for a Connect-style secret store API
pub struct ConnectClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    // name/id -> vault id, resolved once per run
    vault_cache: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for ConnectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectClient")
            .field("base_url", &self.base_url)
            .field("token", &"***")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct VaultSummary {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ItemSummary {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    fields: Vec<Field>,
}

#[derive(Debug, Deserialize)]
struct Field {
    id: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

impl ConnectClient {
    /// Create a client for `base_url` using a service account token
    pub fn new(base_url: &str, token: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            vault_cache: Mutex::new(HashMap::new()),
        })
    }

    /// GET a JSON resource, classifying HTTP failures for `reference`
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        reference: &VaultRef,
    ) -> Result<T, FetchError> {
        let url = format!("{}/v1/{}", self.base_url, path);
        debug!("GET {url}");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| unavailable(reference, e.into()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| unavailable(reference, anyhow::Error::from(e).context("malformed store response")));
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::PermissionDenied {
                reference: reference.to_string(),
            }),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound {
                reference: reference.to_string(),
            }),
            other => Err(unavailable(
                reference,
                anyhow::anyhow!("store returned HTTP {other}"),
            )),
        }
    }

    /// Resolve the vault named in `reference` to its id
    async fn resolve_vault(&self, reference: &VaultRef) -> Result<String, FetchError> {
        if let Some(id) = self.vault_cache.lock().await.get(&reference.vault) {
            return Ok(id.clone());
        }
        let vaults: Vec<VaultSummary> = self.get_json("vaults", reference).await?;
        let vault_id = match_by_id_or_name(&vaults, &reference.vault, |v| (&v.id, &v.name))
            .ok_or_else(|| FetchError::NotFound {
                reference: reference.to_string(),
            })?
            .id
            .clone();
        self.vault_cache
            .lock()
            .await
            .insert(reference.vault.clone(), vault_id.clone());
        Ok(vault_id)
    }

    /// Resolve the item named in `reference` within `vault_id` to its id
    async fn resolve_item(
        &self,
        vault_id: &str,
        reference: &VaultRef,
    ) -> Result<String, FetchError> {
        let items: Vec<ItemSummary> = self
            .get_json(&format!("vaults/{vault_id}/items"), reference)
            .await?;
        match_by_id_or_name(&items, &reference.item, |i| (&i.id, &i.title))
            .map(|item| item.id.clone())
            .ok_or_else(|| FetchError::NotFound {
                reference: reference.to_string(),
            })
    }
}

#[async_trait]
impl SecretStore for ConnectClient {
    async fn fetch(&self, reference: &VaultRef) -> Result<Vec<u8>, FetchError> {
        let vault_id = self.resolve_vault(reference).await?;
        let item_id = self.resolve_item(&vault_id, reference).await?;
        let item: Item = self
            .get_json(&format!("vaults/{vault_id}/items/{item_id}"), reference)
            .await?;

        let value = find_field(&item.fields, &reference.field).ok_or_else(|| {
            FetchError::NotFound {
                reference: reference.to_string(),
            }
        })?;
        Ok(value.as_bytes().to_vec())
    }
}

fn unavailable(reference: &VaultRef, source: anyhow::Error) -> FetchError {
    FetchError::Unavailable {
        reference: reference.to_string(),
        source,
    }
}

/// Match a summary list entry by exact id first, then by name/title
fn match_by_id_or_name<'a, T>(
    entries: &'a [T],
    wanted: &str,
    parts: impl Fn(&T) -> (&String, &String),
) -> Option<&'a T> {
    entries
        .iter()
        .find(|e| parts(e).0 == wanted)
        .or_else(|| entries.iter().find(|e| parts(e).1 == wanted))
}

/// Select a field by id or label; fields without a value do not match
fn find_field<'a>(fields: &'a [Field], wanted: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|f| f.id == wanted || f.label.as_deref() == Some(wanted))
        .and_then(|f| f.value.as_deref())
}
