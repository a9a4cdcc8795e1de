use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::{truncate_output, ExecOutcome, ExecutionLimits};
use crate::error::{Result, SandboxError};
use crate::session::{Session, SessionManager};

/// Slack on top of the evaluator's own time limit before the transport call
/// is abandoned.
const TRANSPORT_GRACE: Duration = Duration::from_secs(2);

/// One request per connection: a JSON line in, a JSON line out. The evaluator
/// process inside the container enforces `max_duration_seconds` itself and
/// reports time-limit violations through `error`.
#[derive(Debug, Serialize)]
pub struct EvalRequest<'a> {
    pub code: &'a str,
    pub max_duration_seconds: f64,
}

#[derive(Debug, Deserialize)]
pub struct EvalResponse {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub elapsed_seconds: f64,
}

/// Stateful variant: session-local variables, attached libraries, and open
/// database handles live in the evaluator process and persist across calls.
pub(super) async fn run(
    manager: &SessionManager,
    session: &Arc<Session>,
    code: &str,
    limits: ExecutionLimits,
) -> Result<ExecOutcome> {
    let port = session
        .host_port
        .ok_or_else(|| SandboxError::internal("persistent session has no evaluator port"))?;

    let request = EvalRequest {
        code,
        max_duration_seconds: limits.max_duration.as_secs_f64(),
    };

    let deadline = limits.max_duration + TRANSPORT_GRACE;
    let response = match tokio::time::timeout(deadline, round_trip(port, &request)).await {
        Err(_) => {
            return Err(SandboxError::Timeout {
                message: format!(
                    "execution exceeded {:.1} seconds",
                    limits.max_duration.as_secs_f64()
                ),
                retryable: false,
            })
        }
        Ok(Err(e)) => {
            debug!(session_id = %session.id, port, "evaluator round trip failed: {e}");
            return Err(manager.classify_transport_failure(session).await);
        }
        Ok(Ok(response)) => response,
    };

    let (output, output_truncated) = truncate_output(&response.output, limits.max_output_bytes);

    if let Some(error_text) = response.error {
        if error_text.to_lowercase().contains("time limit") {
            return Err(SandboxError::Timeout {
                message: error_text,
                retryable: false,
            });
        }
        return Ok(ExecOutcome {
            success: false,
            output,
            result: None,
            error: Some(error_text),
            exit_code: None,
            elapsed_seconds: response.elapsed_seconds,
            output_truncated,
        });
    }

    Ok(ExecOutcome {
        success: true,
        output,
        result: response.result,
        error: None,
        exit_code: None,
        elapsed_seconds: response.elapsed_seconds,
        output_truncated,
    })
}

async fn round_trip(port: u16, request: &EvalRequest<'_>) -> std::io::Result<EvalResponse> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_vec(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    write_half.write_all(&line).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;
    if response_line.trim().is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "evaluator closed the connection without a response",
        ));
    }
    serde_json::from_str(&response_line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
