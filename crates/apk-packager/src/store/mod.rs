//! Blob storage for uploaded project assets and built packages.
//!
//! Keys are namespaced per project (`projects/<id>/<file>`). Puts overwrite;
//! there is no locking contract between writers.

mod http;
mod local;

pub use http::HttpAssetStore;
pub use local::LocalAssetStore;

use crate::config::{StoreKind, StoreSettings};
use crate::error::Result;

pub const SOURCE_FILE: &str = "source.sb3";
pub const ICON_FILE: &str = "icon.png";
pub const KEYSTORE_FILE: &str = "keystore.p12";
pub const APK_FILE: &str = "app.apk";

pub trait AssetStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `bytes` under `key` and returns a reference callers can hand out.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String>;

    /// Deletes every object whose key starts with `prefix`.
    fn delete(&self, prefix: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

pub fn project_key(project_id: &str, file_name: &str) -> String {
    format!("projects/{project_id}/{file_name}")
}

pub fn project_prefix(project_id: &str) -> String {
    format!("projects/{project_id}/")
}

pub fn open_store(settings: &StoreSettings) -> Result<Box<dyn AssetStore>> {
    match settings.kind {
        StoreKind::Local => Ok(Box::new(LocalAssetStore::new(&settings.root))),
        StoreKind::Http => Ok(Box::new(HttpAssetStore::from_settings(settings)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::{AssetStore, LocalAssetStore, project_key, project_prefix};

    #[test]
    fn keys_are_namespaced_per_project() {
        assert_eq!(project_key("P1", "app.apk"), "projects/P1/app.apk");
        assert_eq!(project_prefix("P1"), "projects/P1/");
    }

    #[test]
    fn delete_prefix_only_touches_that_project() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalAssetStore::new(tmp.path());
        store.put(&project_key("P1", "source.sb3"), b"a").unwrap();
        store.put(&project_key("P1", "icon.png"), b"b").unwrap();
        store.put(&project_key("P10", "source.sb3"), b"c").unwrap();

        store.delete(&project_prefix("P1")).unwrap();

        assert!(!store.exists(&project_key("P1", "source.sb3")).unwrap());
        assert!(!store.exists(&project_key("P1", "icon.png")).unwrap());
        assert_eq!(
            store.get(&project_key("P10", "source.sb3")).unwrap(),
            Some(b"c".to_vec())
        );
    }
}
