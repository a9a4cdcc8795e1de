mod evaluator;
mod oneshot;

use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ExecMode;
use crate::docker::ExecBudgets;
use crate::error::{Result, SandboxError};
use crate::session::SessionManager;

/// Package installs get a longer leash than code execution.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-call overrides of the execution defaults, validated from the caller's
/// `limits` object.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub max_duration: Duration,
    pub max_output_bytes: usize,
}

impl ExecutionLimits {
    pub fn from_payload(
        payload: Option<&Value>,
        default_duration: Duration,
        default_output_bytes: usize,
    ) -> Result<Self> {
        let defaults = Self {
            max_duration: default_duration,
            max_output_bytes: default_output_bytes,
        };
        let Some(payload) = payload else {
            return Ok(defaults);
        };
        let Some(object) = payload.as_object() else {
            return Err(SandboxError::invalid_argument("limits must be an object"));
        };

        let max_duration = match object.get("max_duration_seconds") {
            None => defaults.max_duration,
            Some(v) => {
                let secs = v.as_f64().ok_or_else(|| {
                    SandboxError::invalid_argument("max_duration_seconds must be a number")
                })?;
                if secs <= 0.0 || !secs.is_finite() {
                    return Err(SandboxError::invalid_argument(
                        "max_duration_seconds must be > 0",
                    ));
                }
                Duration::from_secs_f64(secs)
            }
        };

        let max_output_bytes = match object.get("max_output_bytes") {
            None => defaults.max_output_bytes,
            Some(v) => {
                let bytes = v.as_u64().ok_or_else(|| {
                    SandboxError::invalid_argument("max_output_bytes must be an integer")
                })?;
                if bytes == 0 {
                    return Err(SandboxError::invalid_argument(
                        "max_output_bytes must be > 0",
                    ));
                }
                bytes as usize
            }
        };

        Ok(Self {
            max_duration,
            max_output_bytes,
        })
    }
}

/// Result of one execute call, variant-independent. A language-level failure
/// is `success: false` with the plain error text; manager-level failures are
/// `SandboxError`s instead.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub success: bool,
    pub output: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub elapsed_seconds: f64,
    pub output_truncated: bool,
}

/// Cut a string down to the byte cap without splitting a UTF-8 sequence.
pub fn truncate_output(output: &str, max_bytes: usize) -> (String, bool) {
    if output.len() <= max_bytes {
        return (output.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    (output[..end].to_string(), true)
}

impl SessionManager {
    /// Run a code string in a session. Serialized per session: one call runs,
    /// one may queue, more are rejected with `session_busy`.
    pub async fn execute_in_session(
        &self,
        id: &str,
        code: &str,
        limits_payload: Option<&Value>,
    ) -> Result<ExecOutcome> {
        if code.trim().is_empty() {
            return Err(SandboxError::invalid_argument(
                "code must be a non-empty string",
            ));
        }
        if code.len() > self.config().max_code_chars {
            return Err(SandboxError::invalid_argument_with(
                "code exceeds max allowed size",
                json!({ "max_code_chars": self.config().max_code_chars }),
            ));
        }
        let limits = ExecutionLimits::from_payload(
            limits_payload,
            self.config().default_exec_timeout,
            self.config().max_output_bytes,
        )?;

        let session = self.lookup(id)?;
        let _slot = session.try_acquire_exec()?;
        let _guard = session.lock_exec().await;

        session.touch();
        let outcome = match self.config().exec_mode {
            ExecMode::OneShot => oneshot::run(self, &session, code, limits).await?,
            ExecMode::Persistent => evaluator::run(self, &session, code, limits).await?,
        };
        session.record_execution(outcome.success, outcome.elapsed_seconds, code.len());
        session.touch();
        Ok(outcome)
    }

    /// Install a package into the session through the variant's installer.
    /// Requires the creation profile to have network access.
    pub async fn install_package(
        &self,
        id: &str,
        package: &str,
        source: Option<&str>,
    ) -> Result<(String, i64)> {
        validate_package_name(package)?;
        if let Some(source) = source {
            validate_package_source(source)?;
        }
        if self.config().network_disabled() {
            return Err(SandboxError::invalid_argument(
                "package installation requires network access, but sessions are created with network_mode=none",
            ));
        }

        let session = self.lookup(id)?;
        let _slot = session.try_acquire_exec()?;
        let _guard = session.lock_exec().await;
        session.touch();

        let argv = match self.config().exec_mode {
            ExecMode::OneShot => {
                let mut argv = vec![
                    self.config().interpreter.clone(),
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "--no-cache-dir".to_string(),
                ];
                if let Some(source) = source {
                    argv.push("--index-url".to_string());
                    argv.push(source.to_string());
                }
                argv.push(package.to_string());
                argv
            }
            ExecMode::Persistent => {
                let repos = source.unwrap_or("https://cloud.r-project.org");
                vec![
                    "Rscript".to_string(),
                    "-e".to_string(),
                    format!("install.packages(\"{package}\", repos = \"{repos}\")"),
                ]
            }
        };

        let capture = match self
            .runtime()
            .exec(
                &session.container,
                argv,
                ExecBudgets {
                    time: INSTALL_TIMEOUT,
                    bytes: self.config().max_output_bytes,
                },
            )
            .await
        {
            Ok(capture) => capture,
            Err(e) => return Err(self.classify_session_failure(&session, e).await),
        };

        if capture.timed_out {
            return Err(SandboxError::Timeout {
                message: format!(
                    "package installation exceeded {} seconds",
                    INSTALL_TIMEOUT.as_secs()
                ),
                retryable: false,
            });
        }

        let mut output = String::from_utf8_lossy(&capture.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&capture.stderr);
        if !stderr.trim().is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(stderr.trim_end());
        }

        session.touch();
        Ok((output, capture.exit_code.unwrap_or(-1)))
    }
}

fn validate_package_name(package: &str) -> Result<()> {
    let package = package.trim();
    if package.is_empty() {
        return Err(SandboxError::invalid_argument(
            "package_name must be a non-empty string",
        ));
    }
    let ok = package
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-=<>~[],+".contains(c));
    if !ok {
        return Err(SandboxError::invalid_argument(
            "package_name contains unsupported characters",
        ));
    }
    Ok(())
}

fn validate_package_source(source: &str) -> Result<()> {
    let ok = !source.is_empty()
        && source
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-:/@%?&=".contains(c));
    if !ok {
        return Err(SandboxError::invalid_argument(
            "source contains unsupported characters",
        ));
    }
    Ok(())
}
