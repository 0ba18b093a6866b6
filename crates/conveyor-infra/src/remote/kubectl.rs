//! `kubectl exec` implementation of [`RemoteCommand`].
//!
//! An execution unit is a Kubernetes Job. Its pod is looked up by the unit
//! label (`job-name` by default) and the command runs through `sh -c` in the
//! handle's container. The child process is killed if the caller's future is
//! dropped, so an outer timeout also stops the command.

use std::process::Stdio;

use conveyor_core::backend::BackendError;
use conveyor_core::backend::remote::{ExecOutput, RemoteCommand};
use conveyor_types::config::KubectlSettings;
use conveyor_types::task::ExecutionHandle;
use tokio::process::Command;

/// Runs commands in unit pods through the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlExec {
    settings: KubectlSettings,
}

impl KubectlExec {
    pub fn new(settings: KubectlSettings) -> Self {
        Self { settings }
    }

    fn base_args(&self, handle: &ExecutionHandle) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(context) = &self.settings.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.push("--namespace".to_string());
        args.push(handle.namespace.clone());
        args
    }

    fn lookup_args(&self, handle: &ExecutionHandle) -> Vec<String> {
        let mut args = self.base_args(handle);
        args.extend([
            "get".to_string(),
            "pods".to_string(),
            "--selector".to_string(),
            format!("{}={}", self.settings.unit_label, handle.unit),
            "--output".to_string(),
            "jsonpath={.items[0].metadata.name}".to_string(),
        ]);
        args
    }

    fn exec_args(&self, handle: &ExecutionHandle, pod: &str, command: &str) -> Vec<String> {
        let mut args = self.base_args(handle);
        args.push("exec".to_string());
        args.push(pod.to_string());
        if let Some(container) = &handle.container {
            args.push("--container".to_string());
            args.push(container.clone());
        }
        args.extend(["--".to_string(), "sh".to_string(), "-c".to_string(), command.to_string()]);
        args
    }

    async fn run(&self, args: &[String]) -> Result<ExecOutput, BackendError> {
        let output = Command::new(&self.settings.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BackendError::Unavailable(format!("failed to run {}: {e}", self.settings.binary))
            })?;

        Ok(ExecOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Name of the pod running `handle`'s unit.
    async fn resolve_pod(&self, handle: &ExecutionHandle) -> Result<String, BackendError> {
        let args = self.lookup_args(handle);
        let output = self.run(&args).await?;
        if !output.success {
            return Err(BackendError::CommandFailed {
                command: format!("{} {}", self.settings.binary, args.join(" ")),
                stderr: output.stderr.trim().to_string(),
            });
        }
        let pod = output.stdout.trim();
        if pod.is_empty() {
            return Err(BackendError::UnitNotFound(handle.unit.clone()));
        }
        Ok(pod.to_string())
    }
}

impl RemoteCommand for KubectlExec {
    async fn exec(&self, handle: &ExecutionHandle, command: &str) -> Result<ExecOutput, BackendError> {
        let pod = self.resolve_pod(handle).await?;
        tracing::debug!(unit = handle.unit.as_str(), pod = pod.as_str(), command, "kubectl exec");
        self.run(&self.exec_args(handle, &pod, command)).await
    }
}
