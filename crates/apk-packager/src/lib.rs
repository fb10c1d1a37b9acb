pub mod callback;
pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod keystore;
pub mod log_sanitize;
pub mod logging;
pub mod packager;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod signer;
pub mod store;

pub use error::{Error, Result};
