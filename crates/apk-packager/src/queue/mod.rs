//! Durable build queue shared by every worker process.
//!
//! The queue is the only shared mutable state between workers. A request is
//! claimed (Queued → Building) inside one locking transaction, and finalized
//! by the worker that claimed it.

mod sqlite;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub use sqlite::SqliteQueue;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Building,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "building" => Ok(Self::Building),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(Error::msg(format!("unknown build status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRequest {
    pub id: i64,
    pub project_id: String,
    pub owner_id: String,
    /// Unix milliseconds.
    pub requested_at: i64,
    pub status: BuildStatus,
    pub artifact_ref: Option<String>,
    pub artifact_sha256: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(skip)]
    pub keystore_pass: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded {
        artifact_ref: String,
        artifact_sha256: String,
    },
    Failed {
        reason: String,
    },
}

impl BuildOutcome {
    pub fn status(&self) -> BuildStatus {
        match self {
            Self::Succeeded { .. } => BuildStatus::Succeeded,
            Self::Failed { .. } => BuildStatus::Failed,
        }
    }
}

pub trait BuildQueue: Send {
    fn register_project(&mut self, project: &Project) -> Result<()>;

    fn project(&self, project_id: &str) -> Result<Option<Project>>;

    /// Drops the project record and its build history. Returns false if unknown.
    fn remove_project(&mut self, project_id: &str) -> Result<bool>;

    /// Enqueues a request unless the owner already has one queued or building.
    fn submit(&mut self, project_id: &str, owner_id: &str) -> Result<BuildRequest>;

    /// Atomically takes the oldest eligible queued request and marks it building.
    fn claim_next(&mut self) -> Result<Option<BuildRequest>>;

    /// Finalizes a building request. Requests in any other state are left alone.
    fn complete(&mut self, id: i64, outcome: &BuildOutcome) -> Result<()>;

    fn get(&self, id: i64) -> Result<Option<BuildRequest>>;

    fn list_for_project(&self, project_id: &str) -> Result<Vec<BuildRequest>>;
}
