//! Execution backends: where build commands run and where build files live.
//!
//! Two implementations share the [`Executor`] contract: [`container::ContainerExecutor`]
//! provisions a disposable container per build, [`host::HostExecutor`] runs
//! directly under a local directory. Sessions are handed out by a
//! [`SessionFactory`] and torn down when the [`ExecutionSession`] drops.

pub mod container;
pub mod host;

use std::collections::BTreeMap;
use std::io::{BufReader, Read, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Component, Path};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;

use crate::config::{BackendKind, BackendSettings};
use crate::error::{Error, Result};
use crate::log_sanitize::{display_command, sanitize_log_line};

pub use container::ContainerExecutor;
pub use host::HostExecutor;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Relative paths resolve under the workdir; absolute paths are used as-is.
    pub cwd: Option<String>,
    /// Overlay applied on top of the backend's base environment.
    pub env: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn in_dir(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

pub trait Executor: Send {
    fn set_workdir(&mut self, path: &str);

    fn workdir(&self) -> &str;

    /// Runs `command` to completion. Only a zero exit status is success.
    fn run(&self, command: &str, args: &[String], opts: &RunOptions) -> Result<()>;

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()>;

    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Recursive delete; a missing path is not an error.
    fn remove(&self, path: &str) -> Result<()>;

    /// Destroys the underlying instance. Must be idempotent and must not fail.
    fn teardown(&mut self) {}
}

/// Owns one backend instance for the duration of a single build attempt.
pub struct ExecutionSession {
    inner: Box<dyn Executor>,
}

impl ExecutionSession {
    pub fn new(inner: Box<dyn Executor>) -> Self {
        Self { inner }
    }
}

impl Deref for ExecutionSession {
    type Target = dyn Executor;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for ExecutionSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

pub trait SessionFactory: Send + Sync {
    fn open(&self) -> Result<ExecutionSession>;
}

/// Opens sessions for the backend selected in `[backend]`.
#[derive(Debug, Clone)]
pub struct BackendFactory {
    settings: BackendSettings,
}

impl BackendFactory {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl SessionFactory for BackendFactory {
    fn open(&self) -> Result<ExecutionSession> {
        match self.settings.kind {
            BackendKind::Container => {
                let engine = container::pick_container_engine(self.settings.engine.as_deref())?;
                let mut exec = ContainerExecutor::new(engine, self.settings.image.clone());
                // A half-created container is still removed when the session drops.
                let started = exec.start();
                let session = ExecutionSession::new(Box::new(exec));
                started?;
                Ok(session)
            }
            // The packager points the session at `[builder] template_dir`.
            BackendKind::Host => Ok(ExecutionSession::new(Box::new(HostExecutor::new()))),
        }
    }
}

pub(crate) fn to_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

/// Joins `path` onto a posix `base`, normalizing `.` and `..` segments.
/// Absolute `path` values replace `base`.
pub(crate) fn join_posix(base: &str, path: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    };
    for comp in Path::new(&joined).components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    format!("/{}", parts.join("/"))
}

pub(crate) fn posix_parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".into(),
        Some(i) => path[..i].to_string(),
    }
}

pub(crate) fn posix_file_name(path: &str) -> Result<&str> {
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::msg(format!("path has no file name: {path}")))
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Spawns `cmd` and forwards its output line by line to our stdout/stderr,
/// then maps a non-zero exit to `Error::CommandFailed`.
///
/// `command` and `args` are what the caller asked for, which for the container
/// backend differ from the engine invocation actually spawned.
pub(crate) fn stream_command(mut cmd: Command, command: &str, args: &[String]) -> Result<()> {
    tracing::debug!(command = %display_command(command, args), "spawning");

    // Own process group so a stray read from the controlling TTY cannot stop us.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(command, e))?;

    forward_output(&mut child);

    let status = child
        .wait()
        .map_err(|e| Error::msg(format!("wait failed for {command}: {e}")))?;
    if !status.success() {
        return Err(Error::CommandFailed {
            command: command.to_string(),
            args: args.to_vec(),
            exit_code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

pub(crate) fn spawn_error(command: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        return Error::not_found(format!("executable '{command}'"));
    }
    Error::msg(format!("spawn failed for {command}: {e}"))
}

fn forward_output(child: &mut Child) {
    let (tx, rx) = mpsc::channel::<(Stream, String)>();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            read_output_stream(out, Stream::Stdout, tx)
        }));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || {
            read_output_stream(err, Stream::Stderr, tx)
        }));
    }
    drop(tx);

    for (stream, line) in rx {
        let line = sanitize_log_line(&line);
        if line.is_empty() {
            continue;
        }
        let _ = match stream {
            Stream::Stdout => writeln!(std::io::stdout().lock(), "{line}"),
            Stream::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        };
    }
    for r in readers {
        let _ = r.join();
    }
}

fn read_output_stream<R: Read>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send((stream, line));
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send((stream, line));
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send((stream, String::from_utf8_lossy(&pending).into_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::{join_posix, posix_file_name, posix_parent};

    #[test]
    fn join_posix_resolves_relative_segments() {
        assert_eq!(
            join_posix("/app/packages/android-app", "./android/app/x.apk"),
            "/app/packages/android-app/android/app/x.apk"
        );
        assert_eq!(join_posix("/app/a", "../b/c"), "/app/b/c");
        assert_eq!(join_posix("/app/a", "/abs/path"), "/abs/path");
        assert_eq!(join_posix("/", "."), "/");
    }

    #[test]
    fn parent_and_file_name() {
        assert_eq!(posix_parent("/app/public/scratch.html"), "/app/public");
        assert_eq!(posix_parent("/keystore.p12"), "/");
        assert_eq!(posix_file_name("/app/public/scratch.html").unwrap(), "scratch.html");
        assert!(posix_file_name("/app/public/").is_err());
    }
}
