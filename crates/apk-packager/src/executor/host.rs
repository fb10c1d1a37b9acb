use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::{Executor, RunOptions, stream_command};

/// Runs build steps as direct child processes under a local directory.
#[derive(Debug, Clone)]
pub struct HostExecutor {
    workdir: String,
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HostExecutor {
    pub fn new() -> Self {
        Self {
            workdir: "/".into(),
        }
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            Path::new(&self.workdir).join(p)
        }
    }
}

impl Executor for HostExecutor {
    fn set_workdir(&mut self, path: &str) {
        self.workdir = path.to_string();
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    fn run(&self, command: &str, args: &[String], opts: &RunOptions) -> Result<()> {
        let cwd = match opts.cwd.as_deref() {
            Some(c) => self.resolve(c),
            None => PathBuf::from(&self.workdir),
        };
        let mut cmd = Command::new(command);
        cmd.args(args).current_dir(&cwd).envs(&opts.env);
        stream_command(cmd, command, args)
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<()> {
        atomic_write(&self.resolve(path), bytes)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let p = self.resolve(path);
        fs::read(&p).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(p.display().to_string())
            } else {
                Error::msg(format!("failed to read {}: {e}", p.display()))
            }
        })
    }

    fn remove(&self, path: &str) -> Result<()> {
        let p = self.resolve(path);
        let md = match fs::symlink_metadata(&p) {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::msg(format!("failed to stat {}: {e}", p.display())));
            }
        };
        let res = if md.is_dir() {
            fs::remove_dir_all(&p)
        } else {
            fs::remove_file(&p)
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!("failed to remove {}: {e}", p.display()))),
        }
    }
}

pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::msg(format!(
            "failed to write temp file {}: {e}",
            tmp.display()
        )));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::HostExecutor;
    use crate::error::Error;
    use crate::executor::{Executor, RunOptions, to_args};

    fn exec_in(dir: &std::path::Path) -> HostExecutor {
        let mut exec = HostExecutor::new();
        exec.set_workdir(dir.to_str().expect("utf8 tempdir"));
        exec
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = exec_in(tmp.path());
        let payload: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();

        exec.write_file("nested/dir/blob.bin", &payload).expect("write");
        assert_eq!(exec.read_file("nested/dir/blob.bin").expect("read"), payload);

        exec.write_file("nested/dir/blob.bin", b"short").expect("overwrite");
        assert_eq!(exec.read_file("nested/dir/blob.bin").expect("read"), b"short");
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = exec_in(tmp.path());
        let err = exec.read_file("nope.txt").unwrap_err();
        assert!(err.is_not_found(), "unexpected err: {err}");
    }

    #[test]
    fn non_zero_exit_reports_command_args_and_code() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = exec_in(tmp.path());
        let args = to_args(["-c", "exit 3"]);
        let err = exec.run("sh", &args, &RunOptions::default()).unwrap_err();
        match err {
            Error::CommandFailed {
                command,
                args: got,
                exit_code,
            } => {
                assert_eq!(command, "sh");
                assert_eq!(got, args);
                assert_eq!(exit_code, 3);
            }
            other => panic!("unexpected err: {other}"),
        }
    }

    #[test]
    fn zero_exit_resolves() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = exec_in(tmp.path());
        exec.run("true", &[], &RunOptions::default()).expect("true succeeds");
    }

    #[test]
    fn env_overlay_and_relative_cwd_apply() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = exec_in(tmp.path());
        exec.write_file("sub/.keep", b"").expect("mkdir via write");

        let opts = RunOptions::in_dir("sub").with_env("APP_ID", "com.example.app");
        exec.run("sh", &to_args(["-c", "printf %s \"$APP_ID\" > out.txt"]), &opts)
            .expect("run");
        assert_eq!(exec.read_file("sub/out.txt").expect("read"), b"com.example.app");
    }

    #[test]
    fn remove_is_recursive_and_tolerates_missing_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = exec_in(tmp.path());
        exec.write_file("android/app/build.gradle", b"x").expect("write");

        exec.remove("./android").expect("remove tree");
        assert!(!tmp.path().join("android").exists());
        exec.remove("./android").expect("second remove is a no-op");
    }

    #[test]
    fn missing_executable_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let exec = exec_in(tmp.path());
        let err = exec
            .run("definitely-not-a-real-binary-xyz", &[], &RunOptions::default())
            .unwrap_err();
        assert!(err.is_not_found(), "unexpected err: {err}");
    }
}
