//! # dvtool
//!
//! Command line front end for the Dataverse authentication broker.
//!
//! ## Modules
//!
//! - [`commands`] - Argument parsing and command execution
//! - [`config`] - `config.toml` plus environment variable loading
//! - [`dataverse`] - Web API calls made with acquired tokens
//! - [`error`] - Application error type
//! - [`logger`] - Logging setup
//! - [`system`] - Reference implementations of the broker's external collaborators

pub mod commands;
pub mod config;
pub mod dataverse;
pub mod error;
pub mod logger;
pub mod system;

pub use error::{AppError, AppResult};
