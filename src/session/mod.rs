mod files;
mod paths;

pub use files::{FileContent, FileEntry};
pub use paths::{normalize_session_path, to_user_path, SANDBOX_ROOT};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, ExecMode};
use crate::docker::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStatus,
};
use crate::error::{Result, SandboxError};

pub const CONTAINER_NAME_PREFIX: &str = "sandboxd-session-";

/// Grace given to the container on stop before the kill.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// One entry of the per-session execution journal.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub elapsed_seconds: f64,
    pub code_len: usize,
}

#[derive(Debug)]
struct LastUsed {
    wall: DateTime<Utc>,
    mono: Instant,
}

/// A live session: one container plus its bookkeeping. Shared via `Arc`; the
/// interior mutability is limited to last-use stamps, the journal, and the
/// execute serialization state.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub container: ContainerHandle,
    pub created_at: DateTime<Utc>,
    /// Host side of the evaluator port mapping (persistent variant only).
    pub host_port: Option<u16>,
    pub workspace_dir: Option<PathBuf>,
    /// Per-session idle timeout override from `create_session`.
    pub idle_override: Option<Duration>,
    /// Environment injected at creation; immutable for the session lifetime.
    pub env_snapshot: Vec<String>,
    last_used: Mutex<LastUsed>,
    journal: Mutex<Vec<JournalEntry>>,
    /// Serializes executes on this session; see `try_acquire_exec`.
    exec_lock: tokio::sync::Mutex<()>,
    /// Running plus queued executes. Single-slot queue: one running, at most
    /// one waiting, the rest get `session_busy`.
    exec_slots: AtomicUsize,
}

impl Session {
    fn new(
        id: String,
        container: ContainerHandle,
        host_port: Option<u16>,
        workspace_dir: Option<PathBuf>,
        idle_override: Option<Duration>,
        env_snapshot: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            container,
            created_at: now,
            host_port,
            workspace_dir,
            idle_override,
            env_snapshot,
            last_used: Mutex::new(LastUsed {
                wall: now,
                mono: Instant::now(),
            }),
            journal: Mutex::new(Vec::new()),
            exec_lock: tokio::sync::Mutex::new(()),
            exec_slots: AtomicUsize::new(0),
        }
    }

    /// Bump last-use. Called on every operation that touches the session.
    pub fn touch(&self) {
        let mut last = self.last_used.lock().unwrap();
        last.wall = Utc::now();
        last.mono = Instant::now();
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used.lock().unwrap().wall
    }

    /// Monotonic idle duration since the last touch.
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().mono.elapsed()
    }

    pub(crate) fn record_execution(&self, success: bool, elapsed_seconds: f64, code_len: usize) {
        self.journal.lock().unwrap().push(JournalEntry {
            timestamp: Utc::now(),
            success,
            elapsed_seconds,
            code_len,
        });
    }

    pub fn journal_len(&self) -> usize {
        self.journal.lock().unwrap().len()
    }

    /// Claim an execute slot. The first caller runs, a second queues behind
    /// the exec lock, further callers are rejected.
    pub(crate) fn try_acquire_exec(self: &Arc<Self>) -> Result<ExecSlot> {
        let occupied = self.exec_slots.fetch_add(1, Ordering::SeqCst);
        if occupied >= 2 {
            self.exec_slots.fetch_sub(1, Ordering::SeqCst);
            return Err(SandboxError::SessionBusy(self.id.clone()));
        }
        Ok(ExecSlot {
            session: Arc::clone(self),
        })
    }

    pub(crate) async fn lock_exec(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_lock.lock().await
    }
}

/// RAII release of a claimed execute slot.
pub(crate) struct ExecSlot {
    session: Arc<Session>,
}

impl Drop for ExecSlot {
    fn drop(&mut self) {
        self.session.exec_slots.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot row returned by `list_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    pub history_count: usize,
}

struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    /// Creates in flight: counted against the cap before the container
    /// exists so concurrent allocates cannot overshoot.
    reserved: usize,
    /// Containers whose removal failed with the daemon unreachable; the
    /// reaper retries these each tick.
    pending_removal: Vec<ContainerHandle>,
}

/// Owns the set of live sessions and drives their lifecycle through the
/// runtime adapter. The registry mutex guards pure bookkeeping only; no I/O
/// happens under it.
pub struct SessionManager {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Mutex<Registry>,
}

impl SessionManager {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            registry: Mutex::new(Registry {
                sessions: HashMap::new(),
                reserved: 0,
                pending_removal: Vec::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    fn idle_timeout_for(&self, session: &Session) -> Duration {
        session.idle_override.unwrap_or(self.config.idle_timeout)
    }

    /// Mint a session: reserve a capacity slot, create and start the
    /// container, capture the evaluator port mapping, insert the record.
    /// Any failure after create removes the partial container.
    pub async fn create_session(&self, idle_override: Option<Duration>) -> Result<Arc<Session>> {
        let reservation = {
            let mut registry = self.registry.lock().unwrap();
            if registry.sessions.len() + registry.reserved >= self.config.max_sessions {
                return Err(SandboxError::CapacityExhausted {
                    max_sessions: self.config.max_sessions,
                });
            }
            registry.reserved += 1;
            SlotReservation {
                registry: &self.registry,
                committed: false,
            }
        };

        let id = Uuid::new_v4().to_string();

        let workspace_dir = match &self.config.workspace_root {
            Some(root) => {
                let dir = root.join(&id);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| SandboxError::internal(format!("workspace dir: {e}")))?;
                Some(dir)
            }
            None => None,
        };

        let spec = self.build_spec(&id, workspace_dir.clone());
        let handle = self.runtime.create(&spec).await?;

        if let Err(e) = self.runtime.start(&handle).await {
            self.remove_partial(&handle).await;
            return Err(e);
        }

        let host_port = match self.config.exec_mode {
            ExecMode::Persistent => {
                let state = match self
                    .runtime
                    .inspect(&handle, Some(self.config.evaluator_port))
                    .await
                {
                    Ok(state) => state,
                    Err(e) => {
                        self.remove_partial(&handle).await;
                        return Err(e);
                    }
                };
                match state.host_port {
                    Some(port) => Some(port),
                    None => {
                        self.remove_partial(&handle).await;
                        return Err(SandboxError::runtime_unavailable(format!(
                            "no host mapping reported for evaluator port {}",
                            self.config.evaluator_port
                        )));
                    }
                }
            }
            ExecMode::OneShot => None,
        };

        let session = Arc::new(Session::new(
            id.clone(),
            handle,
            host_port,
            workspace_dir,
            idle_override,
            spec.env,
        ));

        {
            let mut registry = self.registry.lock().unwrap();
            registry.reserved -= 1;
            registry.sessions.insert(id.clone(), Arc::clone(&session));
        }
        reservation.commit();

        info!(
            session_id = %id,
            host_port = ?session.host_port,
            env_vars = session.env_snapshot.len(),
            "created session"
        );
        Ok(session)
    }

    fn build_spec(&self, id: &str, workspace_dir: Option<PathBuf>) -> ContainerSpec {
        // Containers reach a host-local database through the gateway address.
        let mut extra_hosts = Vec::new();
        let db = &self.config.db;
        let db_host = if db.host == "localhost" || db.host == "127.0.0.1" {
            extra_hosts.push("host.docker.internal:host-gateway".to_string());
            "host.docker.internal".to_string()
        } else {
            db.host.clone()
        };

        let mut env = vec![
            format!("DB_HOST={db_host}"),
            format!("DB_PORT={}", db.port),
            format!("DB_USER={}", db.user),
            format!("DB_PASSWORD={}", db.password),
            format!("DB_NAME={}", db.name),
        ];
        if let Some(token) = &self.config.package_index_token {
            env.push(format!("PACKAGE_INDEX_TOKEN={token}"));
        }

        let mut labels = HashMap::new();
        labels.insert("sandboxd.session.id".to_string(), id.to_string());
        labels.insert("sandboxd.managed".to_string(), "true".to_string());

        // The workspace is tmpfs unless a host directory is bound over it.
        let mut tmpfs = self.config.tmpfs.clone();
        let workspace_bind = workspace_dir.map(|dir| {
            tmpfs.remove(SANDBOX_ROOT);
            (dir, SANDBOX_ROOT.to_string())
        });

        ContainerSpec {
            name: format!("{CONTAINER_NAME_PREFIX}{id}"),
            image: self.config.image.clone(),
            env,
            labels,
            memory_bytes: self.config.memory_bytes,
            cpu_quota: self.config.cpu_quota,
            cpu_period: self.config.cpu_period,
            tmpfs,
            network_mode: self.config.effective_network(),
            extra_hosts,
            workspace_bind,
            evaluator_port: match self.config.exec_mode {
                ExecMode::Persistent => Some(self.config.evaluator_port),
                ExecMode::OneShot => None,
            },
            command: match self.config.exec_mode {
                // Keep the container alive between exec calls.
                ExecMode::OneShot => Some(vec!["sleep".to_string(), "infinity".to_string()]),
                // The image entrypoint runs the evaluator.
                ExecMode::Persistent => None,
            },
        }
    }

    /// Best-effort cleanup of a container that never became a session.
    async fn remove_partial(&self, handle: &ContainerHandle) {
        if let Err(e) = self.runtime.stop_and_remove(handle, STOP_GRACE).await {
            warn!(container = %handle, "failed to remove partial container: {e}");
            self.queue_removal(handle.clone());
        }
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<Session>> {
        self.registry
            .lock()
            .unwrap()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))
    }

    pub fn touch(&self, id: &str) -> Result<()> {
        self.lookup(id)?.touch();
        Ok(())
    }

    /// Close a session. Without `force`, a session used within its idle
    /// timeout is refused with `session_active`. The record is removed
    /// before the runtime teardown so the close is immediately observable;
    /// a daemon outage parks the container for the reaper to retry.
    pub async fn close_session(&self, id: &str, force: bool) -> Result<()> {
        let session = self.lookup(id)?;

        if !force && session.idle_for() < self.idle_timeout_for(&session) {
            return Err(SandboxError::SessionActive(id.to_string()));
        }

        self.forget(id);

        if let Err(e) = self
            .runtime
            .stop_and_remove(&session.container, STOP_GRACE)
            .await
        {
            warn!(session_id = %id, "container removal failed, queued for retry: {e}");
            self.queue_removal(session.container.clone());
            return Err(e);
        }

        info!(session_id = %id, "closed session");
        Ok(())
    }

    /// Drop the registry record without touching the runtime.
    pub(crate) fn forget(&self, id: &str) {
        self.registry.lock().unwrap().sessions.remove(id);
    }

    pub(crate) fn queue_removal(&self, handle: ContainerHandle) {
        self.registry.lock().unwrap().pending_removal.push(handle);
    }

    /// Snapshot of live sessions. `include_inactive` keeps entries already
    /// past their idle timeout (deletion stays the reaper's job).
    pub fn list_sessions(&self, include_inactive: bool) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self
            .registry
            .lock()
            .unwrap()
            .sessions
            .values()
            .cloned()
            .collect();

        let mut summaries: Vec<SessionSummary> = sessions
            .into_iter()
            .filter(|s| include_inactive || s.idle_for() < self.idle_timeout_for(s))
            .map(|s| SessionSummary {
                id: s.id.clone(),
                created_at: s.created_at,
                last_used_at: s.last_used_at(),
                host_port: s.host_port,
                history_count: s.journal_len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// One reaper pass: force-close idle sessions and retry parked
    /// removals. Returns the number of sessions closed.
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<String> = {
            let registry = self.registry.lock().unwrap();
            registry
                .sessions
                .values()
                .filter(|s| s.idle_for() >= self.idle_timeout_for(s))
                .map(|s| s.id.clone())
                .collect()
        };

        let mut closed = 0;
        for id in expired {
            match self.close_session(&id, true).await {
                Ok(()) => {
                    info!(session_id = %id, "reaped idle session");
                    closed += 1;
                }
                // Lost the race with an explicit close.
                Err(SandboxError::SessionNotFound(_)) => {}
                Err(e @ SandboxError::RuntimeUnavailable { .. }) => {
                    warn!(session_id = %id, "reap deferred: {e}");
                }
                Err(e) => {
                    warn!(session_id = %id, "reap failed: {e}");
                }
            }
        }

        let parked: Vec<ContainerHandle> = {
            let mut registry = self.registry.lock().unwrap();
            std::mem::take(&mut registry.pending_removal)
        };
        for handle in parked {
            if let Err(e) = self.runtime.stop_and_remove(&handle, STOP_GRACE).await {
                warn!(container = %handle, "parked removal still failing: {e}");
                self.queue_removal(handle);
            }
        }

        closed
    }

    /// Re-qualify a runtime failure on a session-scoped operation: when the
    /// container turns out to be gone, the session is closed out and the
    /// caller sees `session_crashed` instead of a transient runtime error.
    pub(crate) async fn classify_session_failure(
        &self,
        session: &Arc<Session>,
        err: SandboxError,
    ) -> SandboxError {
        if !matches!(err, SandboxError::RuntimeUnavailable { .. }) {
            return err;
        }
        match self.runtime.inspect(&session.container, None).await {
            Ok(state) if state.status == ContainerStatus::Running => err,
            Ok(state) => {
                self.forget(&session.id);
                if state.status == ContainerStatus::Exited {
                    self.queue_removal(session.container.clone());
                }
                SandboxError::SessionCrashed(session.id.clone())
            }
            Err(_) => err,
        }
    }

    /// Classify a failed evaluator round trip: container still running means
    /// the evaluator endpoint is at fault (retryable), container gone means
    /// the session crashed and is closed here.
    pub(crate) async fn classify_transport_failure(&self, session: &Arc<Session>) -> SandboxError {
        match self.runtime.inspect(&session.container, None).await {
            Ok(state) if state.status == ContainerStatus::Running => {
                SandboxError::EvaluatorUnreachable(session.id.clone())
            }
            Ok(state) => {
                self.forget(&session.id);
                if state.status == ContainerStatus::Exited {
                    self.queue_removal(session.container.clone());
                }
                SandboxError::SessionCrashed(session.id.clone())
            }
            Err(e) => e,
        }
    }
}

/// Capacity reservation held while a container is being created. Dropping
/// without `commit` releases the slot (create or start failed).
struct SlotReservation<'a> {
    registry: &'a Mutex<Registry>,
    committed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.lock().unwrap().reserved -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_config, FakeRuntime};

    fn manager_with(max_sessions: usize) -> (Arc<SessionManager>, Arc<FakeRuntime>) {
        let mut config = test_config();
        config.max_sessions = max_sessions;
        let runtime = Arc::new(FakeRuntime::new());
        let manager = Arc::new(SessionManager::new(config, runtime.clone()));
        (manager, runtime)
    }

    #[tokio::test]
    async fn create_lookup_close_round_trip() {
        let (manager, _) = manager_with(4);
        let session = manager.create_session(None).await.unwrap();
        assert!(session.last_used_at() >= session.created_at);

        let found = manager.lookup(&session.id).unwrap();
        assert_eq!(found.id, session.id);

        manager.close_session(&session.id, true).await.unwrap();
        let err = manager.lookup(&session.id).unwrap_err();
        assert_eq!(err.code(), "session_not_found");
    }

    #[tokio::test]
    async fn close_is_idempotent_at_the_caller_boundary() {
        let (manager, _) = manager_with(4);
        let session = manager.create_session(None).await.unwrap();
        manager.close_session(&session.id, true).await.unwrap();
        let err = manager.close_session(&session.id, true).await.unwrap_err();
        assert_eq!(err.code(), "session_not_found");
    }

    #[tokio::test]
    async fn close_without_force_refuses_active_sessions() {
        let (manager, _) = manager_with(4);
        let session = manager.create_session(None).await.unwrap();
        let err = manager.close_session(&session.id, false).await.unwrap_err();
        assert_eq!(err.code(), "session_active");
        assert!(err.retryable());
        // Still live.
        assert!(manager.lookup(&session.id).is_ok());
    }

    #[tokio::test]
    async fn capacity_is_enforced_under_concurrent_creates() {
        let (manager, _) = manager_with(2);
        let attempts: Vec<_> = (0..3)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.create_session(None).await })
            })
            .collect();

        let mut ok = 0;
        let mut exhausted = 0;
        for handle in attempts {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => {
                    assert_eq!(e.code(), "capacity_exhausted");
                    assert!(e.retryable());
                    exhausted += 1;
                }
            }
        }
        assert_eq!(ok, 2);
        assert_eq!(exhausted, 1);

        // Closing one frees a slot.
        let id = manager.list_sessions(true)[0].id.clone();
        manager.close_session(&id, true).await.unwrap();
        assert!(manager.create_session(None).await.is_ok());
    }

    #[tokio::test]
    async fn failed_start_removes_the_partial_container() {
        let (manager, runtime) = manager_with(2);
        runtime.fail_start_once();
        let err = manager.create_session(None).await.unwrap_err();
        assert_eq!(err.code(), "runtime_unavailable");
        // No orphan left behind, no slot leaked.
        assert_eq!(runtime.live_containers(), 0);
        assert!(manager.create_session(None).await.is_ok());
        assert!(manager.create_session(None).await.is_ok());
    }

    #[tokio::test]
    async fn list_filters_idle_sessions_unless_asked() {
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(20);
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(config, runtime);

        let session = manager.create_session(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(manager.list_sessions(false).is_empty());
        let all = manager.list_sessions(true);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, session.id);
    }

    #[tokio::test]
    async fn sweep_reaps_only_expired_sessions() {
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(30);
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(config, runtime.clone());

        let old = manager.create_session(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = manager.create_session(None).await.unwrap();

        let closed = manager.sweep_idle().await;
        assert_eq!(closed, 1);
        assert!(manager.lookup(&old.id).is_err());
        assert!(manager.lookup(&fresh.id).is_ok());
    }

    #[tokio::test]
    async fn idle_override_outlives_the_global_timeout() {
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(10);
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(config, runtime);

        let session = manager
            .create_session(Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(manager.sweep_idle().await, 0);
        assert!(manager.lookup(&session.id).is_ok());
    }

    #[tokio::test]
    async fn workspace_root_gets_a_host_directory_per_session() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.workspace_root = Some(root.path().to_path_buf());
        let runtime = Arc::new(FakeRuntime::new());
        let manager = SessionManager::new(config, runtime);

        let session = manager.create_session(None).await.unwrap();
        let workspace = session.workspace_dir.clone().unwrap();
        assert!(workspace.starts_with(root.path()));
        assert!(workspace.ends_with(&session.id));
        assert!(workspace.is_dir());

        // Close retains the directory so a later session can re-attach.
        manager.close_session(&session.id, true).await.unwrap();
        assert!(workspace.is_dir());
    }

    #[tokio::test]
    async fn close_during_daemon_outage_parks_the_container() {
        let (manager, runtime) = manager_with(2);
        let session = manager.create_session(None).await.unwrap();

        runtime.set_unavailable(true);
        let err = manager.close_session(&session.id, true).await.unwrap_err();
        assert_eq!(err.code(), "runtime_unavailable");
        // The record is gone regardless.
        assert!(manager.lookup(&session.id).is_err());

        // Next sweep drains the parked removal once the daemon is back.
        runtime.set_unavailable(false);
        manager.sweep_idle().await;
        assert_eq!(runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn exec_slots_allow_one_running_one_queued() {
        let (manager, _) = manager_with(2);
        let session = manager.create_session(None).await.unwrap();

        let first = session.try_acquire_exec().unwrap();
        let second = session.try_acquire_exec().unwrap();
        let err = match session.try_acquire_exec() {
            Err(e) => e,
            Ok(_) => panic!("third concurrent execute must be rejected"),
        };
        assert_eq!(err.code(), "session_busy");

        drop(first);
        drop(second);
        assert!(session.try_acquire_exec().is_ok());
    }

    #[tokio::test]
    async fn touch_is_monotonic() {
        let (manager, _) = manager_with(2);
        let session = manager.create_session(None).await.unwrap();
        let before = session.last_used_at();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.touch();
        assert!(session.last_used_at() >= before);
        assert!(session.last_used_at() >= session.created_at);
    }
}
