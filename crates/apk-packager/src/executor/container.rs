use std::io::{Read, Write};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::executor::{
    Executor, RunOptions, join_posix, posix_file_name, posix_parent, spawn_error, stream_command,
    to_args,
};

pub const DEFAULT_IMAGE: &str = "packager-packager";
const NAME_PREFIX: &str = "packager-";
const STOP_GRACE_SECS: &str = "5";

/// One disposable container per build attempt, driven through the docker/podman CLI.
///
/// Files move in and out as single-entry tar streams over `cp`, which needs the
/// destination directory to exist already.
#[derive(Debug)]
pub struct ContainerExecutor {
    engine: String,
    image: String,
    name: Option<String>,
    workdir: String,
}

impl ContainerExecutor {
    pub fn new(engine: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            image: image.into(),
            name: None,
            workdir: "/".into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Creates and starts a uniquely named container from the base image.
    pub fn start(&mut self) -> Result<()> {
        if self.name.is_some() {
            return Err(Error::msg("container already started"));
        }
        let name = unique_name();
        let create = to_args(["create", "--name", name.as_str(), "-t", self.image.as_str()]);
        self.engine_checked(&create)?;
        self.name = Some(name.clone());

        self.engine_checked(&to_args(["start", name.as_str()]))?;
        tracing::info!(container = %name, image = %self.image, "container started");
        Ok(())
    }

    fn container(&self) -> Result<&str> {
        self.name.as_deref().ok_or(Error::NotStarted)
    }

    fn resolve(&self, path: &str) -> String {
        join_posix(&self.workdir, path)
    }

    fn engine_output(&self, args: &[String]) -> Result<Output> {
        Command::new(&self.engine)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(&self.engine, e))
    }

    fn engine_checked(&self, args: &[String]) -> Result<Output> {
        let out = self.engine_output(args)?;
        if !out.status.success() {
            tracing::warn!(
                engine = %self.engine,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "container engine command failed"
            );
            return Err(Error::CommandFailed {
                command: self.engine.clone(),
                args: args.to_vec(),
                exit_code: out.status.code().unwrap_or(-1),
            });
        }
        Ok(out)
    }
}

impl Executor for ContainerExecutor {
    fn set_workdir(&mut self, path: &str) {
        self.workdir = path.to_string();
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    fn run(&self, command: &str, args: &[String], opts: &RunOptions) -> Result<()> {
        let name = self.container()?;
        let cwd = self.resolve(opts.cwd.as_deref().unwrap_or("."));

        let mut cmd = Command::new(&self.engine);
        cmd.arg("exec").arg("-w").arg(&cwd);
        for (k, v) in &opts.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(name).arg(command).args(args);
        // `exec` without -t keeps stdout and stderr apart, and its exit status is
        // the exit status of the process inside the container.
        stream_command(cmd, command, args)
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let name = self.container()?;
        let full = self.resolve(path);
        let dir = posix_parent(&full);
        let file_name = posix_file_name(&full)?;

        self.run("mkdir", &to_args(["-p", dir.as_str()]), &RunOptions::in_dir("/"))?;

        let archive = pack_single_entry(file_name, bytes)?;
        let target = format!("{name}:{dir}");
        let args = to_args(["cp", "-", target.as_str()]);
        let mut child = Command::new(&self.engine)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.engine, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&archive) {
                drop(stdin);
                let _ = child.kill();
                let stderr = child
                    .wait_with_output()
                    .map(|out| String::from_utf8_lossy(&out.stderr).trim().to_string())
                    .unwrap_or_default();
                return Err(Error::msg(format!(
                    "failed to stream archive to {target}: {e}: {stderr}"
                )));
            }
        }
        let out = child
            .wait_with_output()
            .map_err(|e| Error::msg(format!("wait failed for {} cp: {e}", self.engine)))?;
        if !out.status.success() {
            return Err(Error::CommandFailed {
                command: self.engine.clone(),
                args,
                exit_code: out.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let name = self.container()?;
        let full = self.resolve(path);
        let source = format!("{name}:{full}");
        let args = to_args(["cp", source.as_str(), "-"]);
        let out = self.engine_output(&args)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if is_missing_path_text(&self.engine, &stderr) {
                return Err(Error::not_found(full));
            }
            return Err(Error::CommandFailed {
                command: self.engine.clone(),
                args,
                exit_code: out.status.code().unwrap_or(-1),
            });
        }
        unpack_single_entry(&out.stdout)?.ok_or_else(|| Error::not_found(full))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        self.run("rm", &to_args(["-rf", full.as_str()]), &RunOptions::in_dir("/"))
    }

    fn teardown(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        // Stop is best effort; the forced removal below handles a stuck container.
        if let Err(e) = self.engine_output(&to_args(["stop", "-t", STOP_GRACE_SECS, name.as_str()])) {
            tracing::warn!(container = %name, error = %e, "failed to stop container");
        }
        match self.engine_output(&to_args(["rm", "-f", "-v", name.as_str()])) {
            Ok(out) if out.status.success() => {
                tracing::info!(container = %name, "container removed");
            }
            Ok(out) => tracing::warn!(
                container = %name,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "failed to remove container"
            ),
            Err(e) => tracing::warn!(container = %name, error = %e, "failed to remove container"),
        }
    }
}

impl Drop for ContainerExecutor {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn unique_name() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!(
        "{NAME_PREFIX}{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Whether `engine cp` failed because the source path does not exist.
///
/// docker: `Could not find the file /x in container c` or `No such container:path: c:/x`.
/// podman: `"/x" could not be found on container c: no such file or directory`.
fn is_missing_path_text(engine: &str, stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    if engine.ends_with("podman") {
        s.contains("could not be found on container") || s.contains(": no such file or directory")
    } else {
        s.contains("could not find the file") || s.contains("no such container:path")
    }
}

pub(crate) fn pack_single_entry(file_name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder
        .append_data(&mut header, file_name, bytes)
        .map_err(|e| Error::msg(format!("failed to build archive for {file_name}: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| Error::msg(format!("failed to finish archive for {file_name}: {e}")))
}

/// Returns the contents of the first regular file in a tar stream.
pub(crate) fn unpack_single_entry(archive: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut ar = tar::Archive::new(archive);
    let entries = ar
        .entries()
        .map_err(|e| Error::msg(format!("failed to read archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::msg(format!("corrupt archive entry: {e}")))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read archive entry: {e}")))?;
        return Ok(Some(buf));
    }
    Ok(None)
}

/// Chooses the container CLI: `PACKAGER_CONTAINER_ENGINE`, then the configured
/// engine, then the first of docker/podman that answers `--version`.
pub fn pick_container_engine(configured: Option<&str>) -> Result<String> {
    if let Ok(pref) = std::env::var("PACKAGER_CONTAINER_ENGINE") {
        let pref = pref.trim();
        if pref.is_empty() {
            return Err(Error::msg("PACKAGER_CONTAINER_ENGINE is set but empty"));
        }
        if command_works(pref, &["--version"]) {
            return Ok(pref.to_string());
        }
        return Err(Error::msg(format!(
            "container engine '{pref}' from PACKAGER_CONTAINER_ENGINE is not available"
        )));
    }

    if let Some(engine) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(engine.to_string());
    }

    for candidate in ["docker", "podman"] {
        if command_works(candidate, &["--version"]) {
            return Ok(candidate.to_string());
        }
    }
    Err(Error::msg(
        "no container engine found (tried docker, podman); set PACKAGER_CONTAINER_ENGINE",
    ))
}

fn command_works(bin: &str, args: &[&str]) -> bool {
    Command::new(bin)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
