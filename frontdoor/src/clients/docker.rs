use crate::resilience::retry::{TimeoutError, with_timeout};
use async_trait::async_trait;
use std::{io, path::PathBuf, time::Duration};
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ContainerRuntimeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("docker {operation} failed: {message}")]
    Runtime { operation: &'static str, message: String },

    #[error("container runtime call timed out: {0}")]
    Timeout(#[from] TimeoutError),
}

/// The container runtime hosting the sibling proxy. Everything shells out to
/// the `docker` CLI with a per-call deadline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the named container exists and is running.
    async fn is_running(&self, container: String) -> Result<bool, ContainerRuntimeError>;

    async fn start(&self, container: String) -> Result<(), ContainerRuntimeError>;

    async fn restart(&self, container: String) -> Result<(), ContainerRuntimeError>;

    /// Run a command inside the container and return its stdout.
    async fn exec(&self, container: String, command: Vec<String>) -> Result<String, ContainerRuntimeError>;
}

pub struct DockerClient {
    docker_bin: PathBuf,
    timeout: Duration,
}

impl DockerClient {
    pub fn new(docker_bin: impl Into<PathBuf>) -> Self {
        Self { docker_bin: docker_bin.into(), timeout: DEFAULT_TIMEOUT }
    }

    async fn run(&self, operation: &'static str, args: Vec<String>) -> Result<std::process::Output, ContainerRuntimeError> {
        debug!("Running docker {operation}");
        let output = with_timeout(
            self.timeout,
            Command::new(&self.docker_bin).args(&args).kill_on_drop(true).output(),
        )
        .await??;
        Ok(output)
    }

    async fn run_checked(&self, operation: &'static str, args: Vec<String>) -> Result<String, ContainerRuntimeError> {
        let output = self.run(operation, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ContainerRuntimeError::Runtime { operation, message: extract_stderr_message(&output.stderr) })
        }
    }
}

fn extract_stderr_message(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("no output").to_string()
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn is_running(&self, container: String) -> Result<bool, ContainerRuntimeError> {
        let args = vec!["inspect".into(), "-f".into(), "{{.State.Running}}".into(), container.clone()];
        let output = self.run("inspect", args).await?;
        if !output.status.success() {
            // `inspect` fails for unknown containers; that counts as not running.
            warn!("Container '{container}' not inspectable: {}", extract_stderr_message(&output.stderr));
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn start(&self, container: String) -> Result<(), ContainerRuntimeError> {
        self.run_checked("start", vec!["start".into(), container]).await.map(|_| ())
    }

    async fn restart(&self, container: String) -> Result<(), ContainerRuntimeError> {
        self.run_checked("restart", vec!["restart".into(), container]).await.map(|_| ())
    }

    async fn exec(&self, container: String, command: Vec<String>) -> Result<String, ContainerRuntimeError> {
        let mut args = vec!["exec".into(), container];
        args.extend(command);
        self.run_checked("exec", args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_extraction_prefers_last_line() {
        assert_eq!(extract_stderr_message(b"warning: something\nError: no such container\n"), "Error: no such container");
        assert_eq!(extract_stderr_message(b""), "no output");
    }
}
