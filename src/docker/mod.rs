mod client;
mod runtime;

pub use client::DockerClient;
pub use runtime::DockerRuntime;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;

/// Reference to a container, opaque to everything except the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle(pub String);

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the adapter needs to create one session container. The fixed
/// security profile (non-root user, read-only rootfs, dropped capabilities,
/// no-new-privileges) is applied by the adapter itself, not configurable here.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub tmpfs: BTreeMap<String, String>,
    pub network_mode: Option<String>,
    pub extra_hosts: Vec<String>,
    /// Host directory bind-mounted read-write at the given container path.
    pub workspace_bind: Option<(PathBuf, String)>,
    /// Container port published on a daemon-assigned host port.
    pub evaluator_port: Option<u16>,
    /// None lets the image's entrypoint run (persistent evaluator images).
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    /// The daemon no longer knows the container.
    Missing,
}

#[derive(Debug, Clone)]
pub struct ContainerState {
    pub status: ContainerStatus,
    /// Host port mapped to the evaluator port, when one was requested.
    pub host_port: Option<u16>,
}

/// Budgets enforced on an in-container exec.
#[derive(Debug, Clone, Copy)]
pub struct ExecBudgets {
    pub time: Duration,
    pub bytes: usize,
}

/// Captured result of an in-container exec. `timed_out` means the time budget
/// elapsed and the process was signaled; callers decide how that surfaces.
#[derive(Debug, Clone, Default)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
    pub truncated: bool,
    pub timed_out: bool,
}

/// Narrow contract over the container runtime. One concrete implementation
/// per supported runtime; tests substitute an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Stop then remove. Idempotent: a container already gone is success.
    async fn stop_and_remove(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    /// Status plus the host port mapped to `evaluator_port`, if requested.
    async fn inspect(
        &self,
        handle: &ContainerHandle,
        evaluator_port: Option<u16>,
    ) -> Result<ContainerState>;

    /// Run argv inside the container, capturing both streams under the given
    /// budgets. Does not return until the process terminated, the time budget
    /// elapsed (process signaled and reaped), or the byte budget truncated
    /// the capture.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: Vec<String>,
        budgets: ExecBudgets,
    ) -> Result<ExecCapture>;

    /// Unpack a tar archive at the given in-container directory.
    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<()>;

    /// Fetch the file or directory at the given in-container path as a tar
    /// archive.
    async fn get_archive(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>>;
}
