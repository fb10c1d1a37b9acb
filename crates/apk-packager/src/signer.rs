use crate::error::Result;
use crate::executor::{Executor, RunOptions, to_args};

/// Well-known location a stored keystore is written to before signing.
pub const KEYSTORE_PATH: &str = "keystore.p12";
const KEYSTORE_EXT: &str = ".p12";

pub const KEY_SIZE_BITS: u32 = 2048;
pub const VALIDITY_DAYS: u32 = 365 * 99;
pub const PLACEHOLDER_DNAME: &str = "CN=Unknown, OU=Unknown, O=Unknown, L=Unknown, ST=Unknown, C=US";

#[derive(Debug, Clone)]
pub struct KeystoreOptions {
    /// Keystore file stem; the file is `<name>.p12` in the execution root.
    pub name: String,
    /// Required when generating. When `None`, the signing tool uses the only key in the store.
    pub alias: Option<String>,
    pub store_pass: String,
}

/// Signs APKs with one keystore. The keystore file lives inside the execution
/// root of whichever backend is passed to [`Signer::sign_apk`].
#[derive(Debug, Clone)]
pub struct Signer {
    keystore: KeystoreOptions,
}

impl Signer {
    pub fn new(keystore: KeystoreOptions) -> Self {
        Self { keystore }
    }

    /// Binds to a keystore already written to [`KEYSTORE_PATH`].
    pub fn from_stored(store_pass: impl Into<String>) -> Self {
        Self::new(KeystoreOptions {
            name: KEYSTORE_PATH.trim_end_matches(KEYSTORE_EXT).to_string(),
            alias: None,
            store_pass: store_pass.into(),
        })
    }

    /// Writes stored keystore bytes to [`KEYSTORE_PATH`] and binds to them.
    pub fn load(exec: &dyn Executor, keystore: &[u8], store_pass: impl Into<String>) -> Result<Self> {
        exec.write_file(KEYSTORE_PATH, keystore)?;
        Ok(Self::from_stored(store_pass))
    }

    /// Generates a self-signed RSA key pair into a fresh password-protected keystore.
    pub fn generate_keystore(options: KeystoreOptions, exec: &dyn Executor) -> Result<Self> {
        let alias = options.alias.clone().unwrap_or_else(|| options.name.clone());
        let keystore_file = keystore_file(&options.name);
        let args = vec![
            "-genkeypair".to_string(),
            "-alias".into(),
            alias.clone(),
            "-keyalg".into(),
            "RSA".into(),
            "-keysize".into(),
            KEY_SIZE_BITS.to_string(),
            "-keystore".into(),
            keystore_file,
            "-storepass".into(),
            options.store_pass.clone(),
            "-validity".into(),
            VALIDITY_DAYS.to_string(),
            "-dname".into(),
            PLACEHOLDER_DNAME.into(),
        ];
        tracing::info!(keystore = %options.name, alias = %alias, "generating keystore");
        exec.run("keytool", &args, &RunOptions::default())?;

        Ok(Self::new(KeystoreOptions {
            alias: Some(alias),
            ..options
        }))
    }

    pub fn keystore_file(&self) -> String {
        keystore_file(&self.keystore.name)
    }

    pub fn sign_args(&self, unsigned_path: &str, output_path: &str) -> Vec<String> {
        let mut args = to_args(["sign", "--ks"]);
        args.push(self.keystore_file());
        if let Some(alias) = &self.keystore.alias {
            args.push("--ks-key-alias".into());
            args.push(alias.clone());
        }
        args.push("--ks-pass".into());
        args.push(format!("pass:{}", self.keystore.store_pass));
        args.push("--out".into());
        args.push(output_path.into());
        args.push(unsigned_path.into());
        args
    }

    pub fn sign_apk(&self, exec: &dyn Executor, unsigned_path: &str, output_path: &str) -> Result<()> {
        let args = self.sign_args(unsigned_path, output_path);
        tracing::info!(output = %output_path, "signing apk");
        exec.run("apksigner", &args, &RunOptions::default())
    }

    /// Runs `apksigner verify`. This checks that every signature scheme the APK
    /// carries is intact; it does not check which key signed it.
    pub fn verify_apk(&self, exec: &dyn Executor, signed_path: &str) -> Result<()> {
        exec.run(
            "apksigner",
            &to_args(["verify", signed_path]),
            &RunOptions::default(),
        )
    }
}

fn keystore_file(name: &str) -> String {
    format!("{name}{KEYSTORE_EXT}")
}
