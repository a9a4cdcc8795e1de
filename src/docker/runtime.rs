use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus,
    DockerClient, ExecBudgets, ExecCapture,
};
use crate::error::{Result, SandboxError};

/// Slack on top of the in-container time budget before the capture stream is
/// abandoned; covers signal delivery and exec teardown.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

/// Docker implementation of the runtime adapter. Stateless across calls; all
/// state lives in the daemon and in the session registry.
pub struct DockerRuntime {
    client: DockerClient,
}

impl DockerRuntime {
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }

    fn map_err(e: bollard::errors::Error) -> SandboxError {
        SandboxError::runtime_unavailable(e.to_string())
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let mut mounts = Vec::new();
        if let Some((host_dir, container_path)) = &spec.workspace_bind {
            mounts.push(Mount {
                target: Some(container_path.clone()),
                source: Some(host_dir.to_string_lossy().into_owned()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            });
        }

        let mut port_bindings = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        if let Some(port) = spec.evaluator_port {
            let key = format!("{port}/tcp");
            // Empty binding lets the daemon assign a free host port.
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: None,
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes), // Prevent swap usage
            cpu_quota: Some(spec.cpu_quota),
            cpu_period: Some(spec.cpu_period),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(spec.tmpfs.clone().into_iter().collect()),
            network_mode: spec.network_mode.clone(),
            extra_hosts: if spec.extra_hosts.is_empty() {
                None
            } else {
                Some(spec.extra_hosts.clone())
            },
            mounts: if mounts.is_empty() {
                None
            } else {
                Some(mounts)
            },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            user: Some("1000".to_string()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            working_dir: Some("/sandbox".to_string()),
            cmd: spec.command.clone(),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .client
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    SandboxError::ImageMissing(spec.image.clone())
                } else {
                    Self::map_err(e)
                }
            })?;

        info!("Created container {} with ID: {}", spec.name, response.id);
        Ok(ContainerHandle(response.id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.client
            .docker
            .start_container(&handle.0, None::<StartContainerOptions<String>>)
            .await
            .map_err(Self::map_err)?;

        info!("Started container: {}", handle);
        Ok(())
    }

    async fn stop_and_remove(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        let stop = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        if let Err(e) = self.client.docker.stop_container(&handle.0, Some(stop)).await {
            if !is_not_found(&e) && !is_not_modified(&e) {
                return Err(Self::map_err(e));
            }
        }

        let remove = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .client
            .docker
            .remove_container(&handle.0, Some(remove))
            .await
        {
            Ok(()) => {
                info!("Removed container: {}", handle);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Self::map_err(e)),
        }
    }

    async fn inspect(
        &self,
        handle: &ContainerHandle,
        evaluator_port: Option<u16>,
    ) -> Result<ContainerState> {
        let response = match self
            .client
            .docker
            .inspect_container(&handle.0, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => {
                return Ok(ContainerState {
                    status: ContainerStatus::Missing,
                    host_port: None,
                })
            }
            Err(e) => return Err(Self::map_err(e)),
        };

        let status = match response.state.and_then(|s| s.status) {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            _ => ContainerStatus::Exited,
        };

        let host_port = evaluator_port.and_then(|port| {
            response
                .network_settings
                .as_ref()?
                .ports
                .as_ref()?
                .get(&format!("{port}/tcp"))?
                .as_ref()?
                .iter()
                .find_map(|binding| binding.host_port.as_deref()?.parse().ok())
        });

        Ok(ContainerState { status, host_port })
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: Vec<String>,
        budgets: ExecBudgets,
    ) -> Result<ExecCapture> {
        // The time budget is enforced in-container so the process is actually
        // signaled and reaped; the stream deadline below is the backstop for
        // a wedged daemon connection.
        let secs = budgets.time.as_secs().max(1);
        let mut cmd = vec![
            "timeout".to_string(),
            "-k".to_string(),
            "1".to_string(),
            secs.to_string(),
        ];
        cmd.extend(argv);

        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .docker
            .create_exec(&handle.0, exec_config)
            .await
            .map_err(Self::map_err)?;

        let start = self
            .client
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(Self::map_err)?;

        let deadline = Instant::now() + budgets.time + DEADLINE_GRACE;
        let mut capture = ExecCapture::default();

        if let StartExecResults::Attached { mut output, .. } = start {
            loop {
                let msg = match tokio::time::timeout_at(deadline, output.next()).await {
                    Ok(Some(Ok(msg))) => msg,
                    Ok(Some(Err(e))) => {
                        warn!("Error reading exec output: {}", e);
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        capture.timed_out = true;
                        break;
                    }
                };

                let (buf, bytes) = match &msg {
                    LogOutput::StdOut { message } => (&mut capture.stdout, message),
                    LogOutput::StdErr { message } => (&mut capture.stderr, message),
                    _ => continue,
                };

                if buf.len() + bytes.len() > budgets.bytes {
                    let room = budgets.bytes.saturating_sub(buf.len());
                    buf.extend_from_slice(&bytes[..room]);
                    capture.truncated = true;
                    break;
                }
                buf.extend_from_slice(bytes);
            }
        }

        if !capture.timed_out {
            let mut inspect = self
                .client
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(Self::map_err)?;
            // A truncated capture abandons the stream before the process
            // exits; give it a moment to publish an exit code.
            if capture.truncated {
                for _ in 0..10 {
                    if inspect.running != Some(true) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    inspect = self
                        .client
                        .docker
                        .inspect_exec(&exec.id)
                        .await
                        .map_err(Self::map_err)?;
                }
            }
            capture.exit_code = inspect.exit_code;
            // GNU timeout exits 124 when the budget fired in-container.
            if capture.exit_code == Some(124) {
                capture.timed_out = true;
            }
        }

        debug!(
            container = %handle,
            exit_code = ?capture.exit_code,
            truncated = capture.truncated,
            timed_out = capture.timed_out,
            "exec finished"
        );
        Ok(capture)
    }

    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let options = UploadToContainerOptions {
            path,
            ..Default::default()
        };
        self.client
            .docker
            .upload_to_container(&handle.0, Some(options), archive.into())
            .await
            .map_err(Self::map_err)
    }

    async fn get_archive(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions { path };
        let mut stream = self
            .client
            .docker
            .download_from_container(&handle.0, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(e) if is_not_found(&e) => {
                    return Err(SandboxError::invalid_argument(
                        "no such file or directory".to_string(),
                    ))
                }
                Err(e) => return Err(Self::map_err(e)),
            }
        }
        Ok(archive)
    }
}
