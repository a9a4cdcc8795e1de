//! In-memory stand-in for the container runtime, plus test configuration.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{Config, DbEnv, ExecMode};
use crate::docker::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, ContainerStatus,
    ExecBudgets, ExecCapture,
};
use crate::error::{Result, SandboxError};
use crate::session::SANDBOX_ROOT;

pub fn test_config() -> Config {
    let mut tmpfs = BTreeMap::new();
    tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=100M".to_string());
    tmpfs.insert(
        SANDBOX_ROOT.to_string(),
        "rw,noexec,nosuid,size=500M".to_string(),
    );
    Config {
        idle_timeout: Duration::from_secs(300),
        max_sessions: 10,
        image: "python:3.11-slim".to_string(),
        docker_host: None,
        workspace_root: None,
        log_level: "info".to_string(),
        exec_mode: ExecMode::OneShot,
        interpreter: "python3".to_string(),
        evaluator_port: 6311,
        memory_bytes: 512 * 1024 * 1024,
        cpu_quota: 50_000,
        cpu_period: 100_000,
        tmpfs,
        network_mode: None,
        db: DbEnv::default(),
        package_index_token: None,
        default_exec_timeout: Duration::from_secs(30),
        max_output_bytes: 1024 * 1024,
        max_file_bytes: 10 * 1024 * 1024,
        max_code_chars: 100_000,
        reaper_interval: Duration::from_secs(30),
    }
}

struct FakeContainer {
    running: bool,
    host_port: Option<u16>,
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
}

/// Emulates just enough of the daemon for the registry, file, and engine
/// tests: a container table, an in-memory filesystem fed by the archive
/// calls, `ls`/`mkdir` execs, and scripted captures for everything else.
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    counter: AtomicUsize,
    fail_start: AtomicBool,
    fail_exec: AtomicBool,
    unavailable: AtomicBool,
    next_host_port: Mutex<Option<u16>>,
    exec_queue: Mutex<VecDeque<ExecCapture>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            counter: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            next_host_port: Mutex::new(None),
            exec_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fail_start_once(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_exec_once(&self) {
        self.fail_exec.store(true, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn set_next_host_port(&self, port: u16) {
        *self.next_host_port.lock().unwrap() = Some(port);
    }

    /// Queue the capture returned by the next non-ls/mkdir exec.
    pub fn push_exec(&self, capture: ExecCapture) {
        self.exec_queue.lock().unwrap().push_back(capture);
    }

    pub fn live_containers(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn kill_container(&self, handle: &ContainerHandle) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(&handle.0) {
            container.running = false;
        }
    }

    /// Drop raw bytes into a container's filesystem, as if written by code
    /// running inside it.
    pub fn poke_file(&self, handle: &ContainerHandle, path: &str, data: &[u8]) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(&handle.0) {
            container.files.insert(path.to_string(), data.to_vec());
        }
    }

    fn guard_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SandboxError::runtime_unavailable("daemon is down"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.guard_available()?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-container-{n}");

        let host_port = if spec.evaluator_port.is_some() {
            self.next_host_port
                .lock()
                .unwrap()
                .take()
                .or(Some(49000 + n as u16))
        } else {
            None
        };

        let mut dirs = HashSet::new();
        dirs.insert(SANDBOX_ROOT.to_string());
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                running: false,
                host_port,
                files: HashMap::new(),
                dirs,
            },
        );
        Ok(ContainerHandle(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.guard_available()?;
        if self.fail_start.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::runtime_unavailable("start failed"));
        }
        match self.containers.lock().unwrap().get_mut(&handle.0) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(SandboxError::runtime_unavailable("no such container")),
        }
    }

    async fn stop_and_remove(&self, handle: &ContainerHandle, _grace: Duration) -> Result<()> {
        self.guard_available()?;
        self.containers.lock().unwrap().remove(&handle.0);
        Ok(())
    }

    async fn inspect(
        &self,
        handle: &ContainerHandle,
        _evaluator_port: Option<u16>,
    ) -> Result<ContainerState> {
        self.guard_available()?;
        let containers = self.containers.lock().unwrap();
        match containers.get(&handle.0) {
            None => Ok(ContainerState {
                status: ContainerStatus::Missing,
                host_port: None,
            }),
            Some(container) => Ok(ContainerState {
                status: if container.running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Exited
                },
                host_port: container.host_port,
            }),
        }
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: Vec<String>,
        _budgets: ExecBudgets,
    ) -> Result<ExecCapture> {
        self.guard_available()?;
        if self.fail_exec.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::runtime_unavailable("exec failed"));
        }

        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(&handle.0)
            .filter(|c| c.running)
            .ok_or_else(|| SandboxError::runtime_unavailable("container is not running"))?;

        match argv.first().map(String::as_str) {
            Some("ls") => {
                let path = argv.last().expect("ls argv has a path").clone();
                if container.files.contains_key(&path) {
                    let name = path.rsplit('/').next().unwrap_or(&path);
                    return Ok(ExecCapture {
                        stdout: format!("{name}\n").into_bytes(),
                        exit_code: Some(0),
                        ..Default::default()
                    });
                }
                if !container.dirs.contains(&path) {
                    return Ok(ExecCapture {
                        stderr: format!(
                            "ls: cannot access '{path}': No such file or directory\n"
                        )
                        .into_bytes(),
                        exit_code: Some(2),
                        ..Default::default()
                    });
                }
                let prefix = format!("{path}/");
                let mut names: Vec<String> = Vec::new();
                for file in container.files.keys() {
                    if let Some(rest) = file.strip_prefix(&prefix) {
                        if !rest.contains('/') {
                            names.push(rest.to_string());
                        }
                    }
                }
                for dir in &container.dirs {
                    if let Some(rest) = dir.strip_prefix(&prefix) {
                        if !rest.is_empty() && !rest.contains('/') {
                            names.push(format!("{rest}/"));
                        }
                    }
                }
                names.sort();
                Ok(ExecCapture {
                    stdout: format!("{}\n", names.join("\n")).into_bytes(),
                    exit_code: Some(0),
                    ..Default::default()
                })
            }
            Some("mkdir") => {
                let path = argv.last().expect("mkdir argv has a path").clone();
                let mut current = String::new();
                for part in path.split('/').filter(|p| !p.is_empty()) {
                    current.push('/');
                    current.push_str(part);
                    container.dirs.insert(current.clone());
                }
                Ok(ExecCapture {
                    exit_code: Some(0),
                    ..Default::default()
                })
            }
            _ => Ok(self
                .exec_queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ExecCapture {
                    exit_code: Some(0),
                    ..Default::default()
                })),
        }
    }

    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        self.guard_available()?;
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(&handle.0)
            .ok_or_else(|| SandboxError::runtime_unavailable("no such container"))?;

        let mut tar = tar::Archive::new(&archive[..]);
        for entry in tar.entries().expect("valid tar") {
            let mut entry = entry.expect("valid tar entry");
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .expect("utf8 tar path")
                .to_string_lossy()
                .into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).expect("tar body");
            let full = format!("{}/{}", path.trim_end_matches('/'), name);
            container.files.insert(full, data);
        }
        Ok(())
    }

    async fn get_archive(&self, handle: &ContainerHandle, path: &str) -> Result<Vec<u8>> {
        self.guard_available()?;
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(&handle.0)
            .ok_or_else(|| SandboxError::runtime_unavailable("no such container"))?;

        if let Some(data) = container.files.get(path) {
            let name = path.rsplit('/').next().unwrap_or(path);
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, name, data.as_slice())
                .expect("tar build");
            return Ok(builder.into_inner().expect("tar finish"));
        }
        if container.dirs.contains(path) {
            let name = format!("{}/", path.rsplit('/').next().unwrap_or(path));
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            builder
                .append_data(&mut header, name, std::io::empty())
                .expect("tar build");
            return Ok(builder.into_inner().expect("tar finish"));
        }
        Err(SandboxError::invalid_argument(
            "no such file or directory".to_string(),
        ))
    }
}
