//! Build-completion callback: `GET <url>?status=success|failed`.

use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;

use crate::config::{CallbackSettings, resolve_secret};
use crate::error::{Error, Result};

const PROJECT_ID_PLACEHOLDER: &str = "{project_id}";

#[derive(Debug, Clone)]
pub struct Notifier {
    url_template: String,
    token: Option<String>,
    client: Client,
}

impl Notifier {
    pub fn new(url_template: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url_template: url_template.into(),
            token,
            client,
        })
    }

    /// `None` when no callback URL is configured.
    pub fn from_settings(s: &CallbackSettings) -> Result<Option<Self>> {
        let Some(url) = s.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let token = resolve_secret(s.token.as_deref(), s.token_env.as_deref());
        Self::new(url, token).map(Some)
    }

    pub fn url_for(&self, project_id: &str) -> String {
        self.url_template.replace(PROJECT_ID_PLACEHOLDER, project_id)
    }

    pub fn notify(&self, project_id: &str, success: bool) -> Result<()> {
        self.notify_url(&self.url_for(project_id), success)
    }

    /// Sends the callback to an already resolved URL.
    pub fn notify_url(&self, url: &str, success: bool) -> Result<()> {
        let status = status_text(success);
        let mut req = self.client.get(status_url(url, success)?);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("callback to {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "callback to {url} failed with status {}",
                res.status()
            )));
        }
        tracing::info!(url, status, "build callback delivered");
        Ok(())
    }
}

fn status_text(success: bool) -> &'static str {
    if success { "success" } else { "failed" }
}

/// Appends `status=<success|failed>` to the query of `url`, keeping any
/// existing query pairs and fragment.
fn status_url(url: &str, success: bool) -> Result<Url> {
    let mut parsed =
        Url::parse(url).map_err(|e| Error::msg(format!("invalid callback url {url}: {e}")))?;
    parsed
        .query_pairs_mut()
        .append_pair("status", status_text(success));
    Ok(parsed)
}
