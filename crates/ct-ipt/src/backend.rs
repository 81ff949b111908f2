use crate::elevation::{self, ElevationError, Launcher};
use ct_core::config::BackendConfig;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Result of one completed tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Failures that prevent a tool invocation from completing at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} did not finish within {after:?}")]
    Timeout { program: String, after: Duration },
}

/// Runs one rule-table tool invocation per call.
///
/// Implementations receive the tool arguments as discrete tokens and must
/// never route them through a shell. A non-zero exit is a normal
/// [`ToolOutput`]; only spawn failures and timeouts are errors.
pub trait RuleBackend: Send + Sync {
    fn run(&self, args: &[String]) -> impl Future<Output = Result<ToolOutput, BackendError>> + Send;

    /// Name of the tool, for logs and status output.
    fn program(&self) -> &str;
}

/// Runs the real `iptables` binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    binary: String,
    launcher: Launcher,
    timeout: Duration,
}

impl ProcessBackend {
    pub fn new(launcher: Launcher, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            launcher,
            timeout,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, ElevationError> {
        let launcher = elevation::resolve(&config.binary, config.elevation)?;
        tracing::debug!(launcher = %launcher.describe(), "resolved rule-table launcher");
        Ok(Self::new(launcher, config.binary.clone(), config.timeout()))
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl RuleBackend for ProcessBackend {
    async fn run(&self, args: &[String]) -> Result<ToolOutput, BackendError> {
        let mut command = Command::new(&self.launcher.program);
        command
            .args(&self.launcher.prefix)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| BackendError::Spawn {
            program: self.launcher.describe(),
            reason: e.to_string(),
        })?;

        // Dropping the wait future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout {
                program: self.launcher.describe(),
                after: self.timeout,
            })?
            .map_err(|e| BackendError::Spawn {
                program: self.launcher.describe(),
                reason: e.to_string(),
            })?;

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn program(&self) -> &str {
        &self.binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(timeout: Duration) -> ProcessBackend {
        ProcessBackend::new(
            Launcher {
                program: "sh".into(),
                prefix: vec!["-c".into()],
            },
            "sh",
            timeout,
        )
    }

    #[tokio::test]
    async fn test_captures_exit_code_and_streams() {
        let backend = sh(Duration::from_secs(5));
        let output = backend
            .run(&["echo out; echo 'Bad rule' >&2; exit 2".to_string()])
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(2));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "Bad rule\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_expanded() {
        let backend = ProcessBackend::new(Launcher::direct("echo"), "echo", Duration::from_secs(5));
        let output = backend
            .run(&["$(whoami)".to_string(), "a;b".to_string()])
            .await
            .unwrap();
        assert_eq!(output.stdout, "$(whoami) a;b\n");
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let backend = sh(Duration::from_millis(100));
        let err = backend.run(&["sleep 5".to_string()]).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let backend = ProcessBackend::new(
            Launcher::direct("cocotap_nonexistent_binary_xyz"),
            "iptables",
            Duration::from_secs(1),
        );
        let err = backend.run(&[]).await.unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }
}
