//! Small helpers shared by the broker and the CLI.

pub mod env;

pub use env::{EnvUtils, EnvVarError, MASTER_PASSWORD_VAR};
