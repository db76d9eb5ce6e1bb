//! nodedrive-core: research-object manifests over a replicated document,
//! kept consistent with a content-addressed drive and its reference index.

pub mod commands;
pub mod config;
pub mod drive;
pub mod error;
pub mod manifest;
pub mod services;
pub mod utils;

pub use error::{DriveError, DriveResult};
