//! Visual AI command-line front end: configuration and image sources, plus a
//! bounded worker pool and a line-delimited JSON request loop over the
//! orchestrator.

pub mod capture;
pub mod config;
pub mod error;
pub mod server;
pub mod service;

pub use capture::{load_frame, load_frames};
pub use config::{ServiceConfig, SettingsArgs};
pub use error::{CliError, CliResult};
pub use server::{dispatch, serve, Request, Response};
pub use service::{load_providers, ValidationService};
