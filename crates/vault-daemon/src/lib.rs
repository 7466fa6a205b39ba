//! vault-daemon library: native collaborators for vault-core.
//!
//! Exposes the modules to the binary and to integration tests.

pub mod blob_dir;
pub mod config;
pub mod encryption;
pub mod gist;
pub mod json_store;
pub mod services;

pub use blob_dir::FsBlobStore;
pub use config::{Args, Command, Config, ConfigError};
pub use encryption::HttpCredentialProvider;
pub use gist::GistClient;
pub use json_store::JsonFileStore;
pub use services::Services;
