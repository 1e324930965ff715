// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `crictl`-backed runtime client.
//!
//! Every call spawns `crictl` against the configured CRI endpoint, bounded by
//! the CLI's own `--timeout` plus an outer deadline that kills the process.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::types::{
    Container, ContainerConfig, ContainerFilter, ContainerState, ContainerStatus, Image,
    ImageSpec, PodSandbox, PodSandboxConfig, PodSandboxState, PodSandboxStatus, SandboxFilter,
};
use super::{ImageService, RuntimeService};
use crate::error::{MigrationError, MigrationResult, RpcCode};
use crate::types::{ContainerId, SandboxId};

/// Extra time granted to the crictl process beyond the RPC timeout it was given.
const PROCESS_GRACE: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodSandbox>,
}

#[derive(Deserialize)]
struct ContainerList {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Deserialize)]
struct Inspect<T> {
    status: Option<T>,
}

/// Runtime and image client that drives the `crictl` binary.
#[derive(Debug, Clone)]
pub struct CrictlClient {
    binary: PathBuf,
    endpoint: String,
    rpc_timeout: Duration,
}

impl CrictlClient {
    pub fn new(binary: impl Into<PathBuf>, endpoint: impl Into<String>, rpc_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            endpoint: endpoint.into(),
            rpc_timeout,
        }
    }

    /// Run one crictl invocation and return its stdout.
    async fn run(
        &self,
        operation: &'static str,
        args: Vec<OsString>,
        timeout: Duration,
    ) -> MigrationResult<String> {
        let secs = timeout.as_secs().max(1);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--runtime-endpoint")
            .arg(&self.endpoint)
            .arg("--image-endpoint")
            .arg(&self.endpoint)
            .arg("--timeout")
            .arg(format!("{}s", secs))
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            operation = operation,
            endpoint = %self.endpoint,
            timeout_s = secs,
            "Invoking crictl"
        );

        let start = Instant::now();
        let deadline = timeout + PROCESS_GRACE;
        let output = match tokio::time::timeout(deadline, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(MigrationError::RuntimeRpc {
                    operation,
                    code: RpcCode::Unavailable,
                    message: format!("Failed to execute {}: {}", self.binary.display(), e),
                })
            }
            Err(_) => {
                return Err(MigrationError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MigrationError::RuntimeRpc {
                operation,
                code: classify_stderr(&stderr),
                message: stderr,
            });
        }

        tracing::trace!(
            operation = operation,
            elapsed_ms = start.elapsed().as_millis(),
            "crictl completed"
        );

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        args: Vec<OsString>,
    ) -> MigrationResult<T> {
        let stdout = self.run(operation, args, self.rpc_timeout).await?;
        serde_json::from_str(&stdout).map_err(|e| MigrationError::RuntimeRpc {
            operation,
            code: RpcCode::Unknown,
            message: format!("Unparseable crictl output: {}", e),
        })
    }

    async fn run_simple(&self, operation: &'static str, args: Vec<OsString>) -> MigrationResult<()> {
        self.run(operation, args, self.rpc_timeout).await.map(|_| ())
    }
}

/// Map crictl's stderr onto a gRPC-style status code.
fn classify_stderr(stderr: &str) -> RpcCode {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("notfound") || lower.contains("not found") || lower.contains("no such") {
        RpcCode::NotFound
    } else if lower.contains("already exists") || lower.contains("name is reserved") {
        RpcCode::AlreadyExists
    } else if lower.contains("deadline exceeded") || lower.contains("deadlineexceeded") {
        RpcCode::DeadlineExceeded
    } else if lower.contains("unavailable")
        || lower.contains("connection refused")
        || lower.contains("transport")
    {
        RpcCode::Unavailable
    } else if lower.contains("invalid") {
        RpcCode::InvalidArgument
    } else {
        RpcCode::Unknown
    }
}

/// Last non-empty stdout line, which is where crictl prints created IDs.
fn last_line(stdout: &str) -> &str {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("")
}

fn invalid_id(operation: &'static str, e: impl std::fmt::Display) -> MigrationError {
    MigrationError::RuntimeRpc {
        operation,
        code: RpcCode::Unknown,
        message: format!("Runtime returned an invalid ID: {}", e),
    }
}

/// Write a config to a temp file that lives until the returned guard drops.
fn write_config<T: Serialize>(
    operation: &'static str,
    value: &T,
) -> MigrationResult<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("podshift-")
        .suffix(".json")
        .tempfile()
        .map_err(|e| MigrationError::io("creating crictl config file", e))?;

    let json = serde_json::to_vec(value).map_err(|e| MigrationError::RuntimeRpc {
        operation,
        code: RpcCode::InvalidArgument,
        message: format!("Cannot serialize config: {}", e),
    })?;

    file.write_all(&json)
        .and_then(|_| file.flush())
        .map_err(|e| MigrationError::io("writing crictl config file", e))?;

    Ok(file)
}

fn sandbox_state_arg(state: PodSandboxState) -> &'static str {
    match state {
        PodSandboxState::Ready => "ready",
        PodSandboxState::NotReady => "notready",
    }
}

fn container_state_arg(state: ContainerState) -> &'static str {
    match state {
        ContainerState::Created => "created",
        ContainerState::Running => "running",
        ContainerState::Exited => "exited",
        ContainerState::Unknown => "unknown",
    }
}

#[async_trait]
impl RuntimeService for CrictlClient {
    async fn list_pod_sandbox(&self, filter: &SandboxFilter) -> MigrationResult<Vec<PodSandbox>> {
        let mut args: Vec<OsString> = vec!["pods".into(), "-o".into(), "json".into()];
        if let Some(id) = &filter.id {
            args.push("--id".into());
            args.push(id.into());
        }
        if let Some(state) = filter.state {
            args.push("--state".into());
            args.push(sandbox_state_arg(state).into());
        }
        for (key, value) in &filter.label_selector {
            args.push("--label".into());
            args.push(format!("{}={}", key, value).into());
        }

        let list: PodList = self.run_json("ListPodSandbox", args).await?;
        Ok(list.items.into_iter().filter(|p| filter.matches(p)).collect())
    }

    async fn pod_sandbox_status(&self, id: &SandboxId) -> MigrationResult<PodSandboxStatus> {
        let args = vec!["inspectp".into(), "-o".into(), "json".into(), id.as_str().into()];
        let inspect: Inspect<PodSandboxStatus> = self.run_json("PodSandboxStatus", args).await?;
        inspect.status.ok_or_else(|| MigrationError::RuntimeRpc {
            operation: "PodSandboxStatus",
            code: RpcCode::NotFound,
            message: format!("No status for sandbox {}", id),
        })
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> MigrationResult<Vec<Container>> {
        let mut args: Vec<OsString> = vec!["ps".into(), "-a".into(), "-o".into(), "json".into()];
        if let Some(id) = &filter.id {
            args.push("--id".into());
            args.push(id.into());
        }
        if let Some(sandbox) = &filter.pod_sandbox_id {
            args.push("--pod".into());
            args.push(sandbox.as_str().into());
        }
        if let Some(state) = filter.state {
            args.push("--state".into());
            args.push(container_state_arg(state).into());
        }
        for (key, value) in &filter.label_selector {
            args.push("--label".into());
            args.push(format!("{}={}", key, value).into());
        }

        let list: ContainerList = self.run_json("ListContainers", args).await?;
        Ok(list
            .containers
            .into_iter()
            .filter(|c| filter.matches(c))
            .collect())
    }

    async fn container_status(&self, id: &ContainerId) -> MigrationResult<ContainerStatus> {
        let args = vec!["inspect".into(), "-o".into(), "json".into(), id.as_str().into()];
        let inspect: Inspect<ContainerStatus> = self.run_json("ContainerStatus", args).await?;
        inspect.status.ok_or_else(|| MigrationError::RuntimeRpc {
            operation: "ContainerStatus",
            code: RpcCode::NotFound,
            message: format!("No status for container {}", id),
        })
    }

    async fn checkpoint_container(
        &self,
        id: &ContainerId,
        location: &Path,
        timeout: Duration,
    ) -> MigrationResult<()> {
        let mut export = OsString::from("--export=");
        export.push(location.as_os_str());
        let args = vec!["checkpoint".into(), export, id.as_str().into()];
        self.run("CheckpointContainer", args, timeout).await.map(|_| ())
    }

    async fn run_pod_sandbox(
        &self,
        config: &PodSandboxConfig,
        runtime_handler: &str,
    ) -> MigrationResult<SandboxId> {
        let file = write_config("RunPodSandbox", config)?;
        let mut args: Vec<OsString> = vec!["runp".into()];
        if !runtime_handler.is_empty() {
            args.push("--runtime".into());
            args.push(runtime_handler.into());
        }
        args.push(file.path().as_os_str().to_owned());

        let stdout = self.run("RunPodSandbox", args, self.rpc_timeout).await?;
        SandboxId::new(last_line(&stdout)).map_err(|e| invalid_id("RunPodSandbox", e))
    }

    async fn create_container(
        &self,
        sandbox_id: &SandboxId,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
    ) -> MigrationResult<ContainerId> {
        let container_file = write_config("CreateContainer", config)?;
        let sandbox_file = write_config("CreateContainer", sandbox_config)?;
        let args = vec![
            "create".into(),
            sandbox_id.as_str().into(),
            container_file.path().as_os_str().to_owned(),
            sandbox_file.path().as_os_str().to_owned(),
        ];

        let stdout = self.run("CreateContainer", args, self.rpc_timeout).await?;
        ContainerId::new(last_line(&stdout)).map_err(|e| invalid_id("CreateContainer", e))
    }

    async fn start_container(&self, id: &ContainerId) -> MigrationResult<()> {
        self.run_simple("StartContainer", vec!["start".into(), id.as_str().into()])
            .await
    }

    async fn stop_container(&self, id: &ContainerId, timeout: Duration) -> MigrationResult<()> {
        let args = vec![
            "stop".into(),
            "--timeout".into(),
            timeout.as_secs().to_string().into(),
            id.as_str().into(),
        ];
        self.run("StopContainer", args, self.rpc_timeout + timeout)
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, id: &ContainerId) -> MigrationResult<()> {
        self.run_simple("RemoveContainer", vec!["rm".into(), id.as_str().into()])
            .await
    }

    async fn stop_pod_sandbox(&self, id: &SandboxId) -> MigrationResult<()> {
        self.run_simple("StopPodSandbox", vec!["stopp".into(), id.as_str().into()])
            .await
    }

    async fn remove_pod_sandbox(&self, id: &SandboxId) -> MigrationResult<()> {
        self.run_simple("RemovePodSandbox", vec!["rmp".into(), id.as_str().into()])
            .await
    }
}

#[async_trait]
impl ImageService for CrictlClient {
    async fn image_status(&self, image: &ImageSpec) -> MigrationResult<Option<Image>> {
        let args = vec![
            "inspecti".into(),
            "-o".into(),
            "json".into(),
            image.image.as_str().into(),
        ];
        match self.run_json::<Inspect<Image>>("ImageStatus", args).await {
            Ok(inspect) => Ok(inspect.status.filter(|img| !img.id.is_empty())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(&self, image: &ImageSpec, timeout: Duration) -> MigrationResult<String> {
        let args = vec!["pull".into(), image.image.as_str().into()];
        let stdout = self.run("PullImage", args, timeout).await?;
        // "Image is up to date for sha256:..."
        let line = last_line(&stdout);
        Ok(line
            .rsplit_once(" for ")
            .map(|(_, r)| r.to_string())
            .unwrap_or_else(|| image.image.clone()))
    }
}
