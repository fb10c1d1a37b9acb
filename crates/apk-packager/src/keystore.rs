//! Host-side keystore creation for newly registered projects.
//!
//! Keys are produced with the `openssl` CLI in a scratch directory that is
//! deleted afterwards: an AES-encrypted RSA key, a self-signed certificate over
//! it, then both bundled into a PKCS#12 container under the same password.

use std::process::{Command, Stdio};

use base64::Engine;

use crate::error::{Error, Result};
use crate::log_sanitize::display_command;

pub const DEFAULT_SUBJECT: &str = "/CN=MyApp/O=MyCompany/C=US";
const CERT_VALIDITY_DAYS: &str = "3650";
const PASSWORD_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct P12Options {
    pub alias: String,
    pub password: String,
    pub subject: String,
}

impl P12Options {
    pub fn new(alias: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            password: password.into(),
            subject: DEFAULT_SUBJECT.into(),
        }
    }
}

/// Returns the bytes of a fresh PKCS#12 keystore.
pub fn create_p12_keystore(opts: &P12Options) -> Result<Vec<u8>> {
    let pass_arg = format!("pass:{}", opts.password);
    let scratch = tempfile::tempdir()
        .map_err(|e| Error::msg(format!("failed to create keystore scratch dir: {e}")))?;
    let key_path = scratch.path().join("key.pem");
    let cert_path = scratch.path().join("cert.pem");
    let key_arg = key_path.to_string_lossy().into_owned();
    let cert_arg = cert_path.to_string_lossy().into_owned();

    run_openssl(&["genrsa", "-aes256", "-passout", &pass_arg, "-out", &key_arg, "2048"])?;

    run_openssl(&[
        "req",
        "-new",
        "-x509",
        "-subj",
        &opts.subject,
        "-days",
        CERT_VALIDITY_DAYS,
        "-key",
        &key_arg,
        "-passin",
        &pass_arg,
        "-out",
        &cert_arg,
    ])?;

    run_openssl(&[
        "pkcs12",
        "-export",
        "-name",
        &opts.alias,
        "-passin",
        &pass_arg,
        "-passout",
        &pass_arg,
        "-inkey",
        &key_arg,
        "-in",
        &cert_arg,
    ])
}

/// Random alphanumeric password that keytool and apksigner accept unquoted.
pub fn generate_password() -> Result<String> {
    let raw = run_openssl(&["rand", "48"])?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
    let password: String = alphanumeric_only(&encoded).chars().take(PASSWORD_LEN).collect();
    if password.len() < PASSWORD_LEN / 2 {
        return Err(Error::msg("openssl rand returned too little entropy"));
    }
    Ok(password)
}

fn alphanumeric_only(s: &str) -> String {
    s.chars().filter(char::is_ascii_alphanumeric).collect()
}

fn run_openssl(args: &[&str]) -> Result<Vec<u8>> {
    let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    tracing::debug!(command = %display_command("openssl", &owned), "running");

    let child = Command::new("openssl")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| crate::executor::spawn_error("openssl", e))?;

    let out = child
        .wait_with_output()
        .map_err(|e| Error::msg(format!("wait failed for openssl: {e}")))?;
    if !out.status.success() {
        tracing::warn!(
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "openssl failed"
        );
        return Err(Error::CommandFailed {
            command: "openssl".into(),
            args: owned,
            exit_code: out.status.code().unwrap_or(-1),
        });
    }
    Ok(out.stdout)
}

#[cfg(test)]
mod tests {
    use super::{P12Options, alphanumeric_only, create_p12_keystore, generate_password};

    fn have_openssl() -> bool {
        std::process::Command::new("openssl")
            .arg("version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn alphanumeric_filter_drops_base64_punctuation() {
        assert_eq!(alphanumeric_only("ab+/c=1"), "abc1");
    }

    #[test]
    fn generated_password_is_alphanumeric() {
        if !have_openssl() {
            eprintln!("skip: missing openssl");
            return;
        }
        let pw = generate_password().expect("password");
        assert!(pw.len() >= 16);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn creates_non_empty_p12() {
        if !have_openssl() {
            eprintln!("skip: missing openssl");
            return;
        }
        let p12 = create_p12_keystore(&P12Options::new("app", "storePass123")).expect("p12");
        // DER SEQUENCE tag.
        assert_eq!(p12.first(), Some(&0x30));
    }
}
