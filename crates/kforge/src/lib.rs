pub mod assemble;
pub mod config;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod modules;
pub mod overrides;
pub mod planner;
pub mod tools;
pub mod variant;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
