//! Core repository model for `repos`.
//!
//! This crate owns everything that exists before a build starts: locating
//! the repository root, loading project metadata, constructing targets and
//! resolving user patterns into target names.

mod error;
pub mod logfile;
pub mod meta;
mod project;
mod repo;
mod resolve;

pub use error::{Error, Result};
pub use logfile::LogFile;
pub use project::{Project, Rule, Target, TargetName};
pub use repo::Repo;
pub use resolve::{is_literal_pattern, resolve_target_names, resolve_targets};
