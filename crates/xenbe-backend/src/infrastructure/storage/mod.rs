//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the backend's TOML configuration file,
//! falling back to defaults when the file does not exist, and can write a
//! configuration back (used to generate a starter file).

pub mod config;
