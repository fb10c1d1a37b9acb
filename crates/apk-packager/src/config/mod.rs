use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::executor::container::DEFAULT_IMAGE;

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    pub fn settings(&self) -> Result<Settings> {
        Ok(Settings {
            queue: self.deserialize_path("queue")?.unwrap_or_default(),
            worker: self.deserialize_path("worker")?.unwrap_or_default(),
            backend: self.deserialize_path("backend")?.unwrap_or_default(),
            builder: self.deserialize_path("builder")?.unwrap_or_default(),
            store: self.deserialize_path("store")?.unwrap_or_default(),
            compiler: self.deserialize_path("compiler")?.unwrap_or_default(),
            callback: self.deserialize_path("callback")?.unwrap_or_default(),
        })
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("data/packager.db")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_app_id_prefix() -> String {
    "com.bytic".into()
}

fn default_image() -> String {
    DEFAULT_IMAGE.into()
}

fn default_template_dir() -> String {
    crate::packager::TEMPLATE_DIR.into()
}

fn default_store_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_autoplay_flag() -> String {
    "--autoplay".into()
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub backend: BackendSettings,
    pub builder: BuilderSettings,
    pub store: StoreSettings,
    pub compiler: CompilerSettings,
    pub callback: CallbackSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            database: default_database(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Number of polling workers; 0 means one per CPU.
    pub count: usize,
    #[serde(default = "default_app_id_prefix")]
    pub app_id_prefix: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 1,
            app_id_prefix: default_app_id_prefix(),
        }
    }
}

impl WorkerSettings {
    pub fn effective_count(&self) -> usize {
        if self.count == 0 {
            num_cpus::get().max(1)
        } else {
            self.count
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Container,
    Host,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub engine: Option<String>,
    #[serde(default = "default_image")]
    pub image: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            engine: None,
            image: default_image(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    #[serde(default = "default_template_dir")]
    pub template_dir: String,
    pub offline: bool,
    pub proxy: Option<ProxySettings>,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            offline: false,
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Local,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub kind: StoreKind,
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
    pub base_url: String,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            root: default_store_root(),
            base_url: String::new(),
            base_url_env: None,
            token: None,
            token_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// argv of the external compiler; `{input}` and `{output}` are substituted.
    pub command: Vec<String>,
    #[serde(default = "default_autoplay_flag")]
    pub autoplay_flag: String,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            autoplay_flag: default_autoplay_flag(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CallbackSettings {
    /// `{project_id}` is replaced with the built project's id.
    pub url: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
}

/// Reads `inline` or, failing that, the env var named by `env_name`.
pub fn resolve_secret(inline: Option<&str>, env_name: Option<&str>) -> Option<String> {
    if let Some(v) = inline.map(str::trim).filter(|s| !s.is_empty()) {
        return Some(v.to_string());
    }
    let name = env_name.map(str::trim).filter(|s| !s.is_empty())?;
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn take_imports(path: &Path, value: &mut Value) -> Result<Vec<String>> {
    let Some(tbl) = value.as_table_mut() else {
        return Ok(Vec::new());
    };
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::msg(format!(
            "invalid imports in {} (expected array of strings)",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::msg(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    // `extends` is the single parent; `imports` are layered on top of it in order,
    // and the file's own keys win over both.
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    for imp in take_imports(path, &mut value)? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
        merge_values(&mut out, loaded);
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Loads `path` when given, otherwise returns built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => load(p),
        None => Ok(ConfigDoc::empty()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{BackendKind, StoreKind, load};

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let doc = super::ConfigDoc::empty();
        let s = doc.settings().expect("settings");
        assert_eq!(s.backend.kind, BackendKind::Container);
        assert_eq!(s.backend.image, "packager-packager");
        assert_eq!(s.queue.poll_interval_ms, 1000);
        assert_eq!(s.store.kind, StoreKind::Local);
        assert_eq!(s.builder.template_dir, "/app/packages/android-app");
        assert_eq!(s.worker.count, 1);
    }

    #[test]
    fn extends_and_imports_merge_with_local_keys_winning() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            r#"
[backend]
kind = "host"

[queue]
poll_interval_ms = 250
"#,
        )
        .unwrap();
        fs::write(
            tmp.path().join("proxy.toml"),
            r#"
[builder]
offline = true
proxy = { host = "10.0.0.2", port = 3128 }
"#,
        )
        .unwrap();
        fs::write(
            tmp.path().join("worker.toml"),
            r#"
extends = "base.toml"
imports = ["proxy.toml"]

[queue]
poll_interval_ms = 5000
"#,
        )
        .unwrap();

        let doc = load(&tmp.path().join("worker.toml")).expect("load");
        let s = doc.settings().expect("settings");
        assert_eq!(s.backend.kind, BackendKind::Host);
        assert_eq!(s.queue.poll_interval_ms, 5000);
        assert!(s.builder.offline);
        let proxy = s.builder.proxy.expect("proxy");
        assert_eq!(proxy.host, "10.0.0.2");
        assert_eq!(proxy.port, 3128);
    }

    #[test]
    fn import_cycles_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").unwrap();
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").unwrap();
        let err = load(&tmp.path().join("a.toml")).unwrap_err().to_string();
        assert!(err.contains("cycle"), "unexpected err: {err}");
    }

    #[test]
    fn unknown_backend_kind_is_an_error() {
        let doc = super::ConfigDoc {
            path: "<mem>".into(),
            value: toml::from_str("[backend]\nkind = \"vm\"\n").unwrap(),
        };
        let err = doc.settings().unwrap_err().to_string();
        assert!(err.contains("backend"), "unexpected err: {err}");
    }
}
