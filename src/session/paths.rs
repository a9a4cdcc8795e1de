use crate::error::{Result, SandboxError};

/// In-container workspace every file operation is confined to.
pub const SANDBOX_ROOT: &str = "/sandbox";

/// Resolve a caller-supplied path to an absolute in-container path under
/// `/sandbox`. Relative input is joined under the root; absolute input must
/// normalize back under it. Purely lexical: `.` and `..` are resolved here,
/// symlinks are the container's problem (the workspace is mounted noexec and
/// owned by the sandbox user).
pub fn normalize_session_path(path: &str) -> Result<String> {
    let cleaned = path.trim();
    if cleaned.is_empty() {
        return Err(SandboxError::InvalidPath(
            "path must be a non-empty string".to_string(),
        ));
    }

    let candidate = if cleaned.starts_with('/') {
        cleaned.to_string()
    } else {
        format!("{SANDBOX_ROOT}/{cleaned}")
    };
    let normalized = normalize_posix(&candidate);

    if normalized == SANDBOX_ROOT || normalized.starts_with(&format!("{SANDBOX_ROOT}/")) {
        Ok(normalized)
    } else {
        Err(SandboxError::InvalidPath(
            "path must resolve under /sandbox".to_string(),
        ))
    }
}

/// Strip the workspace prefix for responses, giving back the caller-facing
/// relative form.
pub fn to_user_path(absolute: &str) -> String {
    if absolute == SANDBOX_ROOT {
        ".".to_string()
    } else if let Some(rest) = absolute.strip_prefix(&format!("{SANDBOX_ROOT}/")) {
        rest.to_string()
    } else {
        absolute.to_string()
    }
}

/// Lexical normalization of an absolute POSIX path: collapses `//` and `.`,
/// resolves `..` without consulting the filesystem. `..` above the root is
/// clamped at the root.
fn normalize_posix(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}
