//! Adapter around the external project-to-HTML compiler.
//!
//! The compiler is a black box: it is handed the raw project archive and
//! returns one self-contained HTML document.

use std::fs;
use std::process::Command;

use crate::config::CompilerSettings;
use crate::error::{Error, Result};
use crate::executor::spawn_error;
use crate::log_sanitize::display_command;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
pub const HTML_MIME: &str = "text/html";

/// A project accepted by [`ProjectCompiler::load`], plus its packaging options.
#[derive(Debug, Clone)]
pub struct LoadedProject {
    raw: Vec<u8>,
    autoplay: bool,
}

impl LoadedProject {
    pub fn configure(&mut self, autoplay: bool) {
        self.autoplay = autoplay;
    }

    pub fn autoplay(&self) -> bool {
        self.autoplay
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

#[derive(Debug, Clone)]
pub struct PackagedBundle {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

impl PackagedBundle {
    pub fn into_html(self) -> Result<String> {
        String::from_utf8(self.bytes)
            .map_err(|e| Error::msg(format!("compiled bundle {} is not UTF-8: {e}", self.filename)))
    }
}

pub trait ProjectCompiler: Send + Sync {
    fn load(&self, raw: &[u8]) -> Result<LoadedProject> {
        if raw.len() < ZIP_MAGIC.len() || &raw[..ZIP_MAGIC.len()] != ZIP_MAGIC {
            return Err(Error::validation(
                "project source is not an .sb3 archive",
            ));
        }
        Ok(LoadedProject {
            raw: raw.to_vec(),
            autoplay: false,
        })
    }

    fn produce(&self, project: &LoadedProject) -> Result<PackagedBundle>;
}

/// Runs a configured command line. `{input}` and `{output}` in the argv are
/// replaced with temp file paths; the autoplay flag is appended when enabled.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    argv: Vec<String>,
    autoplay_flag: String,
}

impl CommandCompiler {
    pub fn from_settings(s: &CompilerSettings) -> Result<Self> {
        if s.command.is_empty() {
            return Err(Error::msg("[compiler].command is not configured"));
        }
        Ok(Self {
            argv: s.command.clone(),
            autoplay_flag: s.autoplay_flag.clone(),
        })
    }
}

impl ProjectCompiler for CommandCompiler {
    fn produce(&self, project: &LoadedProject) -> Result<PackagedBundle> {
        let scratch = tempfile::tempdir()
            .map_err(|e| Error::msg(format!("failed to create compiler scratch dir: {e}")))?;
        let input = scratch.path().join("project.sb3");
        let output = scratch.path().join("project.html");
        fs::write(&input, project.raw())
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", input.display())))?;

        let input_s = input.to_string_lossy();
        let output_s = output.to_string_lossy();
        let mut argv: Vec<String> = self
            .argv
            .iter()
            .map(|a| a.replace("{input}", &input_s).replace("{output}", &output_s))
            .collect();
        if project.autoplay() && !self.autoplay_flag.is_empty() {
            argv.push(self.autoplay_flag.clone());
        }

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::msg("[compiler].command is empty"))?;
        tracing::info!(command = %display_command(program, args), "compiling project");
        let out = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| spawn_error(program, e))?;
        if !out.status.success() {
            tracing::warn!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "project compiler failed"
            );
            return Err(Error::CommandFailed {
                command: program.clone(),
                args: args.to_vec(),
                exit_code: out.status.code().unwrap_or(-1),
            });
        }

        // Compilers that ignore {output} are expected to print the document instead.
        let bytes = match fs::read(&output) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => out.stdout,
            Err(e) => {
                return Err(Error::msg(format!("failed to read {}: {e}", output.display())));
            }
        };
        if bytes.is_empty() {
            return Err(Error::msg("project compiler produced an empty bundle"));
        }
        Ok(PackagedBundle {
            bytes,
            mime_type: HTML_MIME.into(),
            filename: "project.html".into(),
        })
    }
}

/// Loads, enables autoplay, and renders `raw` to HTML.
pub fn render_html(compiler: &dyn ProjectCompiler, raw: &[u8]) -> Result<String> {
    let mut project = compiler.load(raw)?;
    project.configure(true);
    compiler.produce(&project)?.into_html()
}
