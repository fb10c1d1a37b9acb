use std::process::Command;

use apk_packager::Error;
use apk_packager::executor::{Executor, HostExecutor, RunOptions};
use apk_packager::keystore::{P12Options, create_p12_keystore};
use apk_packager::signer::{KEYSTORE_PATH, KeystoreOptions, Signer};

fn have_keytool() -> bool {
    // keytool has no --version; -help exits 0.
    Command::new("keytool")
        .arg("-help")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn have_bin(name: &str) -> bool {
    Command::new(name)
        .arg("version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn host_in(dir: &std::path::Path) -> HostExecutor {
    let mut exec = HostExecutor::new();
    exec.set_workdir(dir.to_str().expect("utf8 tempdir"));
    exec
}

fn list_keystore(exec: &HostExecutor, file: &str, pass: &str) -> apk_packager::Result<()> {
    exec.run(
        "keytool",
        &[
            "-list".to_string(),
            "-storetype".into(),
            "PKCS12".into(),
            "-keystore".into(),
            file.into(),
            "-storepass".into(),
            pass.into(),
        ],
        &RunOptions::default(),
    )
}

#[test]
fn generated_keystore_opens_with_its_password() {
    if !have_keytool() {
        eprintln!("skip: keytool not installed");
        return;
    }
    let tmp = tempfile::tempdir().expect("tempdir");
    let exec = host_in(tmp.path());
    let signer = Signer::generate_keystore(
        KeystoreOptions {
            name: "release".into(),
            alias: Some("release_key".into()),
            store_pass: "storePass123".into(),
        },
        &exec,
    )
    .expect("keytool -genkeypair");

    assert_eq!(signer.keystore_file(), "release.p12");
    assert!(tmp.path().join("release.p12").is_file());
    list_keystore(&exec, "release.p12", "storePass123").expect("keystore opens");
    assert!(list_keystore(&exec, "release.p12", "wrong-pass").is_err());
}

#[test]
fn openssl_keystore_is_readable_by_keytool() {
    if !have_keytool() || !have_bin("openssl") {
        eprintln!("skip: keytool or openssl not installed");
        return;
    }
    let bytes = create_p12_keystore(&P12Options::new("key0", "Abc123xyz")).expect("p12");

    let tmp = tempfile::tempdir().expect("tempdir");
    let exec = host_in(tmp.path());
    let signer = Signer::load(&exec, &bytes, "Abc123xyz").expect("load keystore");
    assert_eq!(signer.keystore_file(), KEYSTORE_PATH);
    list_keystore(&exec, KEYSTORE_PATH, "Abc123xyz").expect("keystore opens");
}

/// Binary XML for `<manifest/>`, which apksigner reads as min SDK 1.
fn binary_manifest() -> Vec<u8> {
    fn chunk(kind: u16, header_size: u16, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(kind.to_le_bytes());
        out.extend(header_size.to_le_bytes());
        out.extend((8 + body.len() as u32).to_le_bytes());
        out.extend(body);
        out
    }
    const NONE: u32 = u32::MAX;

    let name: Vec<u16> = "manifest".encode_utf16().collect();
    let mut pool = Vec::new();
    for v in [1u32, 0, 0, 32, 0] {
        pool.extend(v.to_le_bytes()); // count, styles, flags, strings start, styles start
    }
    pool.extend(0u32.to_le_bytes());
    pool.extend((name.len() as u16).to_le_bytes());
    for c in &name {
        pool.extend(c.to_le_bytes());
    }
    pool.extend(0u16.to_le_bytes());

    let mut start = Vec::new();
    for v in [1u32, NONE, NONE, 0] {
        start.extend(v.to_le_bytes()); // line, comment, namespace, name
    }
    for v in [20u16, 20, 0, 0, 0, 0] {
        start.extend(v.to_le_bytes());
    }
    let mut end = Vec::new();
    for v in [1u32, NONE, NONE, 0] {
        end.extend(v.to_le_bytes());
    }

    let mut body = chunk(0x0001, 28, &pool);
    body.extend(chunk(0x0102, 16, &start));
    body.extend(chunk(0x0103, 16, &end));
    chunk(0x0003, 8, &body)
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = u32::MAX;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
        }
    }
    !crc
}

/// A stored (uncompressed) zip holding only `AndroidManifest.xml`.
fn unsigned_apk() -> Vec<u8> {
    let name = b"AndroidManifest.xml";
    let data = binary_manifest();
    let crc = crc32(&data);
    let size = data.len() as u32;

    let mut zip = Vec::new();
    zip.extend(0x0403_4b50u32.to_le_bytes());
    for v in [20u16, 0, 0, 0, 0x21] {
        zip.extend(v.to_le_bytes()); // version, flags, stored, time, date
    }
    zip.extend(crc.to_le_bytes());
    zip.extend(size.to_le_bytes());
    zip.extend(size.to_le_bytes());
    zip.extend((name.len() as u16).to_le_bytes());
    zip.extend(0u16.to_le_bytes());
    zip.extend(name);
    zip.extend(&data);

    let cd_offset = zip.len() as u32;
    zip.extend(0x0201_4b50u32.to_le_bytes());
    for v in [20u16, 20, 0, 0, 0, 0x21] {
        zip.extend(v.to_le_bytes());
    }
    zip.extend(crc.to_le_bytes());
    zip.extend(size.to_le_bytes());
    zip.extend(size.to_le_bytes());
    zip.extend((name.len() as u16).to_le_bytes());
    for v in [0u16, 0, 0, 0] {
        zip.extend(v.to_le_bytes()); // extra, comment, disk, internal attrs
    }
    zip.extend(0u32.to_le_bytes()); // external attrs
    zip.extend(0u32.to_le_bytes()); // local header offset
    zip.extend(name);
    let cd_size = zip.len() as u32 - cd_offset;

    zip.extend(0x0605_4b50u32.to_le_bytes());
    for v in [0u16, 0, 1, 1] {
        zip.extend(v.to_le_bytes());
    }
    zip.extend(cd_size.to_le_bytes());
    zip.extend(cd_offset.to_le_bytes());
    zip.extend(0u16.to_le_bytes());
    zip
}

fn generated_signer(exec: &HostExecutor, store_pass: &str) -> Signer {
    Signer::generate_keystore(
        KeystoreOptions {
            name: "release".into(),
            alias: Some("release_key".into()),
            store_pass: store_pass.into(),
        },
        exec,
    )
    .expect("keytool -genkeypair")
}

#[test]
fn fresh_keystore_signs_an_apk_that_verifies() {
    if !have_keytool() || !have_bin("apksigner") {
        eprintln!("skip: keytool or apksigner not installed");
        return;
    }
    let tmp = tempfile::tempdir().expect("tempdir");
    let exec = host_in(tmp.path());
    exec.write_file("app-unsigned.apk", &unsigned_apk())
        .expect("write apk");

    let signer = generated_signer(&exec, "storePass123");
    signer
        .sign_apk(&exec, "app-unsigned.apk", "app-release.apk")
        .expect("apksigner sign");
    assert!(tmp.path().join("app-release.apk").is_file());
    signer
        .verify_apk(&exec, "app-release.apk")
        .expect("apksigner verify");

    // The unsigned input must not verify.
    assert!(signer.verify_apk(&exec, "app-unsigned.apk").is_err());
}

#[test]
fn wrong_store_password_fails_signing() {
    if !have_keytool() || !have_bin("apksigner") {
        eprintln!("skip: keytool or apksigner not installed");
        return;
    }
    let tmp = tempfile::tempdir().expect("tempdir");
    let exec = host_in(tmp.path());
    exec.write_file("app-unsigned.apk", &unsigned_apk())
        .expect("write apk");
    generated_signer(&exec, "storePass123");

    let wrong = Signer::new(KeystoreOptions {
        name: "release".into(),
        alias: Some("release_key".into()),
        store_pass: "not-the-password".into(),
    });
    let err = wrong
        .sign_apk(&exec, "app-unsigned.apk", "app-release.apk")
        .unwrap_err();
    assert!(matches!(err, Error::CommandFailed { .. }), "unexpected err: {err}");
}
