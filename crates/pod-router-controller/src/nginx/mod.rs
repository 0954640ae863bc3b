//! nginx configuration generation and process control.

pub mod config;
pub mod process;

pub use config::{build_config, build_default_config};
pub use process::{NginxServer, ServerError};
