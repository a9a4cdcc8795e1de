use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which execution engine the gateway runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Fresh interpreter process per call, no state between calls.
    OneShot,
    /// Long-lived evaluator inside the container, state persists across calls.
    Persistent,
}

impl FromStr for ExecMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oneshot" => Ok(ExecMode::OneShot),
            "persistent" => Ok(ExecMode::Persistent),
            other => bail!("unknown exec mode {other:?} (expected oneshot or persistent)"),
        }
    }
}

/// Database connection parameters injected into every container.
#[derive(Debug, Clone, Default)]
pub struct DbEnv {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

/// Immutable process-wide configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub idle_timeout: Duration,
    pub max_sessions: usize,
    pub image: String,
    pub docker_host: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub log_level: String,

    pub exec_mode: ExecMode,
    pub interpreter: String,
    pub evaluator_port: u16,

    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    /// In-container mount path -> tmpfs options string.
    pub tmpfs: BTreeMap<String, String>,
    /// None means the daemon's default network for the chosen mode.
    pub network_mode: Option<String>,

    pub db: DbEnv,
    pub package_index_token: Option<String>,

    pub default_exec_timeout: Duration,
    pub max_output_bytes: usize,
    pub max_file_bytes: usize,
    pub max_code_chars: usize,
    pub reaper_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let exec_mode: ExecMode = env_parse("EXEC_MODE", "oneshot")?;

        Ok(Self {
            idle_timeout: Duration::from_secs(env_parse("SANDBOX_TIMEOUT", "300")?),
            max_sessions: env_parse("MAX_SANDBOXES", "10")?,
            image: env_or("DOCKER_IMAGE", "python:3.11-slim"),
            docker_host: std::env::var("DOCKER_HOST").ok(),
            workspace_root: std::env::var("WORKSPACE_ROOT").ok().map(PathBuf::from),
            log_level: env_or("LOG_LEVEL", "info"),
            exec_mode,
            interpreter: env_or("INTERPRETER", "python3"),
            evaluator_port: env_parse("EVALUATOR_PORT", "6311")?,
            memory_bytes: parse_mem_size(&env_or("SANDBOX_MEMORY", "512m"))
                .context("SANDBOX_MEMORY")?,
            cpu_quota: env_parse("SANDBOX_CPU_QUOTA", "50000")?,
            cpu_period: 100_000,
            tmpfs: parse_tmpfs(&env_or(
                "TMPFS_MOUNTS",
                "/tmp=rw,noexec,nosuid,size=100M;/sandbox=rw,noexec,nosuid,size=500M",
            ))
            .context("TMPFS_MOUNTS")?,
            network_mode: std::env::var("SANDBOX_NETWORK").ok(),
            db: DbEnv {
                host: env_or("DB_HOST", ""),
                port: env_parse("DB_PORT", "5432")?,
                user: env_or("DB_USER", ""),
                password: env_or("DB_PASSWORD", ""),
                name: env_or("DB_NAME", ""),
            },
            package_index_token: std::env::var("PACKAGE_INDEX_TOKEN").ok(),
            default_exec_timeout: Duration::from_secs(env_parse("EXEC_TIMEOUT", "30")?),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", "1048576")?,
            max_file_bytes: env_parse("MAX_FILE_BYTES", "10485760")?,
            max_code_chars: env_parse("MAX_CODE_CHARS", "100000")?,
            reaper_interval: Duration::from_secs(env_parse("REAPER_INTERVAL", "30")?),
        })
    }

    /// Network mode actually applied at container creation. One-shot sessions
    /// get no network unless overridden; persistent sessions need the daemon's
    /// default network for the evaluator port mapping.
    pub fn effective_network(&self) -> Option<String> {
        match (&self.network_mode, self.exec_mode) {
            (Some(mode), _) => Some(mode.clone()),
            (None, ExecMode::OneShot) => Some("none".to_string()),
            (None, ExecMode::Persistent) => None,
        }
    }

    /// Whether containers are created without any network attachment.
    pub fn network_disabled(&self) -> bool {
        self.effective_network().as_deref() == Some("none")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env_or(key, default);
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
}

/// Parse a docker-style memory size ("512m", "2g", plain bytes).
pub fn parse_mem_size(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty size");
    }
    let (digits, multiplier) = if let Some(d) = raw.strip_suffix(['k', 'K']) {
        (d, 1024)
    } else if let Some(d) = raw.strip_suffix(['m', 'M']) {
        (d, 1024 * 1024)
    } else if let Some(d) = raw.strip_suffix(['g', 'G']) {
        (d, 1024 * 1024 * 1024)
    } else {
        (raw, 1)
    };
    let value: i64 = digits.parse().with_context(|| format!("size {raw:?}"))?;
    if value <= 0 {
        bail!("size must be positive, got {raw:?}");
    }
    Ok(value * multiplier)
}

/// Parse "path=options;path=options" into the tmpfs mount map.
pub fn parse_tmpfs(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut mounts = BTreeMap::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        let (path, options) = entry
            .split_once('=')
            .with_context(|| format!("tmpfs entry {entry:?} missing '='"))?;
        let path = path.trim();
        if !path.starts_with('/') {
            bail!("tmpfs path {path:?} must be absolute");
        }
        mounts.insert(path.to_string(), options.trim().to_string());
    }
    Ok(mounts)
}
