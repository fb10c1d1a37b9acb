//! One-shot build driven entirely by environment variables.
//!
//! This is the entry point used when a CI job or a prepared container runs a
//! single build: it fetches the project assets, builds on the local host in
//! offline mode, writes the signed APK to `OUTPUT_PATH` and reports the result
//! to `CALLBACK_URL`.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;

use crate::callback::Notifier;
use crate::compiler::{CommandCompiler, render_html};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::executor::HostExecutor;
use crate::executor::host::atomic_write;
use crate::packager::{AppIdentity, BuilderOptions, Packager};
use crate::signer::Signer;

pub const DEFAULT_OUTPUT_PATH: &str = "/output/app.apk";

/// Where the runner pulls project assets from. Each location is an
/// `http(s)://` URL or a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSources {
    /// `FILES_URL`: a JSON document naming the three asset URLs.
    Manifest(String),
    Direct {
        scratch: String,
        icon: Option<String>,
        keystore: String,
    },
}

#[derive(Debug, Clone)]
pub struct BuildAppEnv {
    pub app_id: String,
    pub app_name: String,
    pub sources: AssetSources,
    pub keystore_pass: String,
    pub output_path: PathBuf,
    pub callback_url: Option<String>,
    pub access_token: Option<String>,
}

impl BuildAppEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| Error::validation(format!("{key} must be set")))
        };

        let sources = match get("FILES_URL") {
            Some(url) => AssetSources::Manifest(url),
            None => AssetSources::Direct {
                scratch: require("SCRATCH_FILE")?,
                icon: get("ICON_FILE"),
                keystore: require("KEYSTORE_FILE")?,
            },
        };
        Ok(Self {
            app_id: require("APP_ID")?,
            app_name: require("APP_NAME")?,
            sources,
            keystore_pass: require("KEYSTORE_PASS")?,
            output_path: get("OUTPUT_PATH")
                .unwrap_or_else(|| DEFAULT_OUTPUT_PATH.into())
                .into(),
            callback_url: get("CALLBACK_URL"),
            access_token: get("ACCESS_TOKEN"),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesManifest {
    scratch_source: Option<String>,
    icon: Option<String>,
    keystore: Option<String>,
}

struct Fetcher {
    client: Client,
    token: Option<String>,
}

impl Fetcher {
    fn new(token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, token })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let mut req = self.client.get(url);
        if let Some(t) = self.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let res = req
            .send()
            .map_err(|e| Error::msg(format!("download of {url} failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::msg(format!(
                "download of {url} failed with status {}",
                res.status()
            )));
        }
        Ok(res)
    }

    fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        if is_url(location) {
            let body = self
                .get(location)?
                .bytes()
                .map_err(|e| Error::msg(format!("download of {location} failed: {e}")))?;
            return Ok(body.to_vec());
        }
        fs::read(location).map_err(|e| Error::msg(format!("failed to read {location}: {e}")))
    }

    fn resolve(&self, sources: &AssetSources) -> Result<(String, Option<String>, String)> {
        match sources {
            AssetSources::Direct {
                scratch,
                icon,
                keystore,
            } => Ok((scratch.clone(), icon.clone(), keystore.clone())),
            AssetSources::Manifest(url) => {
                let manifest: FilesManifest = self
                    .get(url)?
                    .json()
                    .map_err(|e| Error::msg(format!("invalid files manifest at {url}: {e}")))?;
                let scratch = manifest
                    .scratch_source
                    .ok_or_else(|| Error::validation("files manifest has no scratchSource"))?;
                let keystore = manifest
                    .keystore
                    .ok_or_else(|| Error::validation("files manifest has no keystore"))?;
                Ok((scratch, manifest.icon, keystore))
            }
        }
    }
}

fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Runs the build and always attempts the callback. The build error, if
/// any, is returned after the callback.
pub fn run_build_app(env: &BuildAppEnv, settings: &Settings) -> Result<()> {
    let result = build(env, settings);
    match &result {
        Ok(()) => tracing::info!(output = %env.output_path.display(), "build-app finished"),
        Err(e) => tracing::error!(error = %e, "build-app failed"),
    }

    if let Some(url) = env.callback_url.as_deref() {
        let delivered = Notifier::new(url, env.access_token.clone())
            .and_then(|n| n.notify_url(url, result.is_ok()));
        if let Err(e) = delivered {
            tracing::warn!(error = %e, "build callback failed");
        }
    }
    result
}

fn build(env: &BuildAppEnv, settings: &Settings) -> Result<()> {
    let fetcher = Fetcher::new(env.access_token.clone())?;
    let (scratch_loc, icon_loc, keystore_loc) = fetcher.resolve(&env.sources)?;
    let scratch = fetcher.fetch(&scratch_loc)?;
    let icon = icon_loc.as_deref().map(|l| fetcher.fetch(l)).transpose()?;
    let keystore = fetcher.fetch(&keystore_loc)?;

    let compiler = CommandCompiler::from_settings(&settings.compiler)?;
    let app = AppIdentity {
        app_id: env.app_id.clone(),
        app_name: env.app_name.clone(),
        scratch_html: render_html(&compiler, &scratch)?,
        icon,
    };

    let mut options = BuilderOptions::from(&settings.builder);
    options.offline = true;
    let mut exec = HostExecutor::new();
    let mut packager = Packager::new(options, &mut exec);
    packager.init(&app)?;
    let signer = Signer::load(packager.executor(), &keystore, env.keystore_pass.as_str())?;
    packager.build()?;
    let apk = packager.sign(&signer)?;

    atomic_write(&env.output_path, &apk)
}
