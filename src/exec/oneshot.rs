use std::sync::Arc;
use std::time::Instant;

use super::{ExecOutcome, ExecutionLimits};
use crate::docker::ExecBudgets;
use crate::error::{Result, SandboxError};
use crate::session::{Session, SessionManager};

/// Stateless variant: every call is a fresh `<interpreter> -c <code>` exec
/// inside the session container. Nothing persists between calls except the
/// workspace filesystem.
pub(super) async fn run(
    manager: &SessionManager,
    session: &Arc<Session>,
    code: &str,
    limits: ExecutionLimits,
) -> Result<ExecOutcome> {
    let argv = vec![
        manager.config().interpreter.clone(),
        "-c".to_string(),
        code.to_string(),
    ];

    let started = Instant::now();
    let capture = match manager
        .runtime()
        .exec(
            &session.container,
            argv,
            ExecBudgets {
                time: limits.max_duration,
                bytes: limits.max_output_bytes,
            },
        )
        .await
    {
        Ok(capture) => capture,
        Err(e) => return Err(manager.classify_session_failure(session, e).await),
    };
    let elapsed_seconds = started.elapsed().as_secs_f64();

    if capture.timed_out {
        return Err(SandboxError::Timeout {
            message: format!(
                "execution exceeded {:.1} seconds",
                limits.max_duration.as_secs_f64()
            ),
            retryable: false,
        });
    }

    let stderr = String::from_utf8_lossy(&capture.stderr)
        .trim()
        .to_string();

    // A capture cut short by the byte budget can outrun the process; the
    // missing exit code is not a failure, the truncation flag tells the story.
    let success = capture.exit_code == Some(0) || (capture.truncated && capture.exit_code.is_none());

    Ok(ExecOutcome {
        success,
        output: String::from_utf8_lossy(&capture.stdout).into_owned(),
        result: None,
        error: if stderr.is_empty() { None } else { Some(stderr) },
        exit_code: capture.exit_code,
        elapsed_seconds,
        output_truncated: capture.truncated,
    })
}
