//! # dvtool broker
//!
//! Authentication broker for Microsoft Dataverse environments. Turns an
//! environment's stored configuration into a bearer token for the Web API.
//!
//! ## Modules
//!
//! - [`auth`] - Grant flows, token cache and the [`auth::AuthenticationCoordinator`]
//! - [`secrets`] - Secret store contract plus in-memory and encrypted file stores
//! - [`common`] - Shared HTTP client with retry and its errors
//! - [`config`] - Broker settings and tenant endpoints
//! - [`utils`] - Environment variable helpers

pub mod auth;
pub mod common;
pub mod config;
pub mod secrets;
pub mod utils;
