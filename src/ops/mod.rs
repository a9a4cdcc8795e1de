use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SandboxError};
use crate::session::SessionManager;

/// Operation names accepted by the gateway, in dispatch order.
pub const OPERATIONS: &[&str] = &[
    "create_session",
    "list_sessions",
    "close_session",
    "execute_in_session",
    "list_session_files",
    "read_session_file",
    "write_session_file",
    "install_package",
];

/// Maps operation names to handlers and wraps every result in the response
/// envelope. The frontend protocol stays outside; this table is the whole
/// contract.
pub struct Dispatcher {
    manager: Arc<SessionManager>,
}

impl Dispatcher {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Never panics and never errors: every outcome is an envelope.
    pub async fn dispatch(&self, op: &str, args: Value) -> Value {
        let started = std::time::Instant::now();
        let result = match op {
            "create_session" => self.create_session(&args).await,
            "list_sessions" => self.list_sessions(&args).await,
            "close_session" => self.close_session(&args).await,
            "execute_in_session" => self.execute_in_session(&args).await,
            "list_session_files" => self.list_session_files(&args).await,
            "read_session_file" => self.read_session_file(&args).await,
            "write_session_file" => self.write_session_file(&args).await,
            "install_package" => self.install_package(&args).await,
            other => Err(SandboxError::invalid_argument(format!(
                "unknown operation {other:?}"
            ))),
        };

        match result {
            Ok(mut body) => {
                info!(
                    op,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "operation succeeded"
                );
                match body.as_object_mut() {
                    Some(object) => {
                        // Execute reports its own success flag for failing code.
                        object
                            .entry("success".to_string())
                            .or_insert(Value::Bool(true));
                        body
                    }
                    None => SandboxError::internal("handler returned a non-object body").envelope(),
                }
            }
            Err(e) => {
                info!(
                    op,
                    code = e.code(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "operation failed"
                );
                e.envelope()
            }
        }
    }

    async fn create_session(&self, args: &Value) -> Result<Value> {
        let idle_override = match args.get("timeout_seconds") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let secs = v.as_u64().filter(|s| *s > 0).ok_or_else(|| {
                    SandboxError::invalid_argument("timeout_seconds must be a positive integer")
                })?;
                Some(Duration::from_secs(secs))
            }
        };

        let session = self.manager.create_session(idle_override).await?;
        let mut body = Map::new();
        body.insert("id".into(), json!(session.id));
        body.insert("created_at".into(), json!(session.created_at));
        body.insert("last_used_at".into(), json!(session.last_used_at()));
        if let Some(port) = session.host_port {
            body.insert("host_port".into(), json!(port));
        }
        Ok(Value::Object(body))
    }

    async fn list_sessions(&self, args: &Value) -> Result<Value> {
        let include_inactive = opt_bool(args, "include_inactive")?.unwrap_or(false);
        let sessions = self.manager.list_sessions(include_inactive);
        let count = sessions.len();
        Ok(json!({
            "sessions": sessions,
            "count": count,
        }))
    }

    async fn close_session(&self, args: &Value) -> Result<Value> {
        let id = require_str(args, "id")?;
        let force = opt_bool(args, "force")?.unwrap_or(false);
        self.manager.close_session(&id, force).await?;
        Ok(json!({ "message": format!("session {id} closed") }))
    }

    async fn execute_in_session(&self, args: &Value) -> Result<Value> {
        let id = require_str(args, "id")?;
        let code = require_str(args, "code")?;
        let limits = args.get("limits").filter(|v| !v.is_null());

        let outcome = self.manager.execute_in_session(&id, &code, limits).await?;

        let mut body = Map::new();
        body.insert("success".into(), json!(outcome.success));
        body.insert("output".into(), json!(outcome.output));
        if let Some(result) = outcome.result {
            body.insert("result".into(), json!(result));
        }
        if let Some(error) = outcome.error {
            body.insert("error".into(), json!(error));
        }
        if let Some(exit_code) = outcome.exit_code {
            body.insert("exit_code".into(), json!(exit_code));
        }
        body.insert(
            "meta".into(),
            json!({
                "elapsed_seconds": outcome.elapsed_seconds,
                "output_truncated": outcome.output_truncated,
            }),
        );
        Ok(Value::Object(body))
    }

    async fn list_session_files(&self, args: &Value) -> Result<Value> {
        let id = require_str(args, "id")?;
        let path = opt_str(args, "path")?.unwrap_or_else(|| ".".to_string());
        let files = self.manager.list_session_files(&id, &path).await?;
        Ok(json!({ "files": files }))
    }

    async fn read_session_file(&self, args: &Value) -> Result<Value> {
        let id = require_str(args, "id")?;
        let path = require_str(args, "path")?;
        let file = self.manager.read_session_file(&id, &path).await?;
        Ok(serde_json::to_value(file).map_err(SandboxError::internal)?)
    }

    async fn write_session_file(&self, args: &Value) -> Result<Value> {
        let id = require_str(args, "id")?;
        let path = require_str(args, "path")?;
        let content = require_str(args, "content")?;
        self.manager
            .write_session_file(&id, &path, &content)
            .await?;
        Ok(json!({ "message": format!("wrote {path}") }))
    }

    async fn install_package(&self, args: &Value) -> Result<Value> {
        let id = require_str(args, "id")?;
        let package = require_str(args, "package_name")?;
        let source = opt_str(args, "source")?;
        let (output, exit_code) = self
            .manager
            .install_package(&id, &package, source.as_deref())
            .await?;
        Ok(json!({
            "success": exit_code == 0,
            "output": output,
            "exit_code": exit_code,
        }))
    }
}

fn require_str(args: &Value, key: &str) -> Result<String> {
    match args.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(SandboxError::invalid_argument(format!(
            "{key} must be a string"
        ))),
        None => Err(SandboxError::invalid_argument(format!("{key} is required"))),
    }
}

fn opt_str(args: &Value, key: &str) -> Result<Option<String>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(SandboxError::invalid_argument(format!(
            "{key} must be a string"
        ))),
    }
}

fn opt_bool(args: &Value, key: &str) -> Result<Option<bool>> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(SandboxError::invalid_argument(format!(
            "{key} must be a boolean"
        ))),
    }
}
