//! Strategies for making a running proxy pick up a new configuration.

use crate::{weights::ServerWeight, Error, Result};

/// Notifies the proxy that its configuration file changed.
#[async_trait::async_trait]
pub trait Reload: Send + Sync {
    /// Makes the proxy load the configuration file that was just written.
    async fn reload(&self) -> Result<()>;

    /// Applies server weights to the running proxy without a reload. Returns `false` when the
    /// strategy cannot do that, in which case the caller must write and reload instead.
    async fn set_weights(&self, weights: &[ServerWeight]) -> Result<bool>;
}

/// Talks to an HTTP sidecar running beside the proxy.
#[derive(Clone, Debug)]
pub struct Sidecar {
    http: reqwest::Client,
    base: String,
}

impl Sidecar {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn put(&self, req: reqwest::RequestBuilder, url: String) -> Result<()> {
        let rsp = req.send().await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(Error::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reload for Sidecar {
    async fn reload(&self) -> Result<()> {
        let url = format!("{}/api/haproxy", self.base);
        tracing::debug!(%url, "requesting proxy reload");
        self.put(self.http.put(&url), url).await
    }

    async fn set_weights(&self, weights: &[ServerWeight]) -> Result<bool> {
        if weights.is_empty() {
            tracing::debug!("no server weights to update");
            return Ok(true);
        }
        let url = format!("{}/api/weight", self.base);
        tracing::debug!(%url, servers = weights.len(), "updating server weights");
        self.put(self.http.put(&url).json(weights), url).await?;
        Ok(true)
    }
}

/// Runs a shell command on the local host to reload the proxy.
#[derive(Clone, Debug)]
pub struct Command {
    command: String,
    strict: bool,
}

impl Command {
    /// With `strict` unset, a failing reload command is logged but not reported as an error.
    pub fn new(command: impl Into<String>, strict: bool) -> Self {
        Self {
            command: command.into(),
            strict,
        }
    }
}

#[async_trait::async_trait]
impl Reload for Command {
    async fn reload(&self) -> Result<()> {
        match exec(&self.command).await {
            Err(Error::Command { status, .. }) if !self.strict => {
                tracing::warn!(command = %self.command, %status, "reload command failed; ignoring");
                Ok(())
            }
            res => res,
        }
    }

    async fn set_weights(&self, _: &[ServerWeight]) -> Result<bool> {
        Ok(false)
    }
}

/// Runs `command` with `sh -c`, logging its combined output when it fails.
pub async fn exec(command: &str) -> Result<()> {
    tracing::debug!(%command, "running command");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let combined = String::from_utf8_lossy(&combined);

    if output.status.success() {
        tracing::trace!(%command, output = %combined, "command succeeded");
        return Ok(());
    }

    let status = output.status.code().unwrap_or(-1);
    tracing::warn!(%command, %status, output = %combined, "command failed");
    Err(Error::Command {
        command: command.to_string(),
        status,
    })
}
