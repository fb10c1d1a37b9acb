use std::fmt;

use crate::log_sanitize::redact_args;

#[derive(Debug)]
pub enum Error {
    /// An isolated backend was used before `start()` provisioned its instance.
    NotStarted,
    CommandFailed {
        command: String,
        args: Vec<String>,
        exit_code: i32,
    },
    NotFound(String),
    /// The native toolchain rejected the build; wraps the underlying `CommandFailed`.
    BuildFailed(Box<Error>),
    AdmissionDenied {
        owner_id: String,
    },
    ValidationFailed(String),
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn not_found<M: Into<String>>(what: M) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation<M: Into<String>>(msg: M) -> Self {
        Self::ValidationFailed(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } => Some(*exit_code),
            Self::BuildFailed(inner) => inner.exit_code(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "execution backend not started"),
            Self::CommandFailed {
                command,
                args,
                exit_code,
            } => {
                let shown = redact_args(args);
                if shown.is_empty() {
                    write!(f, "command failed (exit {exit_code}): {command}")
                } else {
                    write!(
                        f,
                        "command failed (exit {exit_code}): {command} {}",
                        shown.join(" ")
                    )
                }
            }
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::BuildFailed(inner) => write!(f, "native build failed: {inner}"),
            Self::AdmissionDenied { owner_id } => write!(
                f,
                "a build is already in progress for owner '{owner_id}'"
            ),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
            Self::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BuildFailed(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(err.to_string());
        }
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::msg(format!("queue database error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
