//! nginx process management.
//!
//! Writes generated configuration to disk and drives the nginx binary
//! through shell commands, mirroring how the container image wires the
//! controller and nginx together. A disabled server logs configurations
//! without touching the filesystem or spawning processes, for running the
//! controller outside its pod.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to write {path}: {source}")]
    WriteConfiguration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        output: String,
    },
}

/// Handle to the colocated nginx process.
pub struct NginxServer {
    conf_path: PathBuf,
    enabled: bool,
}

impl NginxServer {
    pub fn new(conf_path: impl Into<PathBuf>) -> Self {
        Self {
            conf_path: conf_path.into(),
            enabled: true,
        }
    }

    /// A server that only logs what it would have done. For local runs
    /// against a remote cluster where no nginx is colocated.
    pub fn disabled(conf_path: impl Into<PathBuf>) -> Self {
        Self {
            conf_path: conf_path.into(),
            enabled: false,
        }
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Writes the configuration to the nginx configuration file.
    pub async fn write_configuration(&self, conf: &str) -> Result<(), ServerError> {
        debug!(configuration = conf, "generated nginx configuration");

        if !self.enabled {
            return Ok(());
        }

        tokio::fs::write(&self.conf_path, conf)
            .await
            .map_err(|source| ServerError::WriteConfiguration {
                path: self.conf_path.clone(),
                source,
            })?;

        info!(path = %self.conf_path.display(), "wrote nginx configuration");
        Ok(())
    }

    /// Writes the configuration and starts nginx as a daemon.
    pub async fn start(&self, conf: &str) -> Result<(), ServerError> {
        self.write_configuration(conf).await?;

        info!("starting nginx");
        self.run("nginx").await
    }

    /// Writes the configuration and signals the running nginx to reload it.
    ///
    /// Safe to call regardless of what configuration nginx currently runs.
    pub async fn reload(&self, conf: &str) -> Result<(), ServerError> {
        self.write_configuration(conf).await?;

        info!("reloading nginx");
        self.run("nginx -s reload").await
    }

    async fn run(&self, command: &str) -> Result<(), ServerError> {
        if !self.enabled {
            return Ok(());
        }

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| ServerError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ServerError::CommandFailed {
                command: command.to_string(),
                status: output.status,
                output: combined,
            });
        }

        Ok(())
    }
}
