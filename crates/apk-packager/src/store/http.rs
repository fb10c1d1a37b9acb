use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};

use crate::config::{StoreSettings, resolve_secret};
use crate::error::{Error, Result};
use crate::store::AssetStore;

/// Object store reached over plain HTTP: `GET`/`PUT`/`DELETE` on
/// `<base_url>/<key>`, optionally with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpAssetStore {
    base: String,
    token: Option<String>,
    client: Client,
}

impl HttpAssetStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let base = base_url.into().trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(Error::msg("HTTP asset store requires a base_url"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base,
            token,
            client,
        })
    }

    pub fn from_settings(s: &StoreSettings) -> Result<Self> {
        let base = resolve_secret(Some(&s.base_url), s.base_url_env.as_deref()).ok_or_else(|| {
            Error::msg("[store] kind = \"http\" requires base_url or base_url_env")
        })?;
        let token = resolve_secret(s.token.as_deref(), s.token_env.as_deref());
        Self::new(base, token)
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base, key.trim_start_matches('/'))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

impl AssetStore for HttpAssetStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let res = self
            .authed(self.client.get(self.url(key)))
            .send()
            .map_err(|e| Error::msg(format!("HTTP download of {key} failed: {e}")))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "HTTP download of {key} failed with status {}",
                res.status()
            )));
        }
        let body = res
            .bytes()
            .map_err(|e| Error::msg(format!("HTTP download of {key} failed: {e}")))?;
        Ok(Some(body.to_vec()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let url = self.url(key);
        let res = self
            .authed(self.client.put(&url).body(bytes.to_vec()))
            .send()
            .map_err(|e| Error::msg(format!("HTTP upload of {key} failed: {e}")))?;
        if res.status().is_success() {
            return Ok(url);
        }
        Err(Error::msg(format!(
            "HTTP upload of {key} failed with status {}",
            res.status()
        )))
    }

    fn delete(&self, prefix: &str) -> Result<()> {
        let res = self
            .authed(self.client.delete(self.url(prefix)))
            .send()
            .map_err(|e| Error::msg(format!("HTTP delete of {prefix} failed: {e}")))?;
        if res.status().is_success() || res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::msg(format!(
            "HTTP delete of {prefix} failed with status {}",
            res.status()
        )))
    }
}
