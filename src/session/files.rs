use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::paths::{normalize_session_path, to_user_path, SANDBOX_ROOT};
use super::{Session, SessionManager};
use crate::docker::ExecBudgets;
use crate::error::{Result, SandboxError};

/// Internal budget for the short execs behind list/mkdir.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);
const LISTING_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub content: String,
    /// Set to "base64" when the file is not valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<&'static str>,
}

impl SessionManager {
    pub async fn list_session_files(&self, id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let resolved = normalize_session_path(path)?;
        let session = self.lookup(id)?;
        session.touch();

        let capture = match self
            .runtime()
            .exec(
                &session.container,
                vec!["ls".to_string(), "-F".to_string(), resolved.clone()],
                ExecBudgets {
                    time: TRANSFER_TIMEOUT,
                    bytes: LISTING_BYTES,
                },
            )
            .await
        {
            Ok(capture) => capture,
            Err(e) => return Err(self.classify_session_failure(&session, e).await),
        };

        if capture.timed_out {
            return Err(SandboxError::Timeout {
                message: "file listing timed out".to_string(),
                retryable: true,
            });
        }
        if capture.exit_code != Some(0) {
            let stderr = String::from_utf8_lossy(&capture.stderr).trim().to_string();
            return Err(SandboxError::invalid_argument(stderr));
        }

        let parent = to_user_path(&resolved);
        let stdout = String::from_utf8_lossy(&capture.stdout);
        let mut entries = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let is_dir = line.ends_with('/');
            // Strip the -F classifier suffix.
            let name = line
                .strip_suffix(['/', '*', '@', '=', '|'])
                .unwrap_or(line)
                .to_string();
            let path = if parent == "." {
                name.clone()
            } else {
                format!("{parent}/{name}")
            };
            entries.push(FileEntry { name, is_dir, path });
        }

        session.touch();
        Ok(entries)
    }

    pub async fn read_session_file(&self, id: &str, path: &str) -> Result<FileContent> {
        let resolved = normalize_session_path(path)?;
        let session = self.lookup(id)?;
        session.touch();

        let fetch = self.runtime().get_archive(&session.container, &resolved);
        let archive = match tokio::time::timeout(TRANSFER_TIMEOUT, fetch).await {
            Err(_) => {
                return Err(SandboxError::Timeout {
                    message: "file transfer timed out".to_string(),
                    retryable: true,
                })
            }
            Ok(Ok(archive)) => archive,
            Ok(Err(e)) => return Err(self.classify_session_failure(&session, e).await),
        };

        let data = self.extract_single_file(&archive)?;
        let content = match String::from_utf8(data) {
            Ok(text) => FileContent {
                content: text,
                encoding: None,
            },
            Err(err) => FileContent {
                content: base64::engine::general_purpose::STANDARD.encode(err.as_bytes()),
                encoding: Some("base64"),
            },
        };

        session.touch();
        Ok(content)
    }

    pub async fn write_session_file(&self, id: &str, path: &str, content: &str) -> Result<()> {
        let resolved = normalize_session_path(path)?;
        if resolved == SANDBOX_ROOT {
            return Err(SandboxError::InvalidPath(
                "path must name a file under /sandbox".to_string(),
            ));
        }
        let data = content.as_bytes();
        if data.len() > self.config().max_file_bytes {
            return Err(SandboxError::FileTooLarge {
                message: "content exceeds max write size".to_string(),
                limit_bytes: self.config().max_file_bytes,
            });
        }

        let session = self.lookup(id)?;
        session.touch();

        let (dir, base) = resolved
            .rsplit_once('/')
            .ok_or_else(|| SandboxError::internal("normalized path missing separator"))?;
        let dir = if dir.is_empty() { "/" } else { dir };

        if dir != SANDBOX_ROOT {
            self.ensure_directory(&session, dir).await?;
        }

        let archive = build_file_archive(base, data)
            .map_err(|e| SandboxError::internal(format!("tar build: {e}")))?;

        let upload = self.runtime().put_archive(&session.container, dir, archive);
        match tokio::time::timeout(TRANSFER_TIMEOUT, upload).await {
            Err(_) => {
                return Err(SandboxError::Timeout {
                    message: "file transfer timed out".to_string(),
                    retryable: true,
                })
            }
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.classify_session_failure(&session, e).await),
        }

        debug!(session_id = %id, path = %resolved, bytes = data.len(), "wrote file");
        session.touch();
        Ok(())
    }

    async fn ensure_directory(&self, session: &Arc<Session>, dir: &str) -> Result<()> {
        let capture = match self
            .runtime()
            .exec(
                &session.container,
                vec!["mkdir".to_string(), "-p".to_string(), dir.to_string()],
                ExecBudgets {
                    time: TRANSFER_TIMEOUT,
                    bytes: LISTING_BYTES,
                },
            )
            .await
        {
            Ok(capture) => capture,
            Err(e) => return Err(self.classify_session_failure(session, e).await),
        };

        if capture.timed_out {
            return Err(SandboxError::Timeout {
                message: "directory creation timed out".to_string(),
                retryable: true,
            });
        }
        if capture.exit_code != Some(0) {
            let stderr = String::from_utf8_lossy(&capture.stderr).trim().to_string();
            return Err(SandboxError::invalid_argument(stderr));
        }
        Ok(())
    }

    /// Pull the first regular file out of a get-archive tarball, enforcing
    /// the read size cap before the body is buffered.
    fn extract_single_file(&self, archive: &[u8]) -> Result<Vec<u8>> {
        let mut tar = tar::Archive::new(archive);
        let entries = tar
            .entries()
            .map_err(|e| SandboxError::internal(format!("tar parse: {e}")))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| SandboxError::internal(format!("tar entry: {e}")))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            if entry.size() > self.config().max_file_bytes as u64 {
                return Err(SandboxError::FileTooLarge {
                    message: "file exceeds max read size".to_string(),
                    limit_bytes: self.config().max_file_bytes,
                });
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| SandboxError::internal(format!("tar read: {e}")))?;
            return Ok(data);
        }

        Err(SandboxError::invalid_argument(
            "path is not a regular file".to_string(),
        ))
    }
}

/// Single-file tar archive as the daemon's put-archive expects, owned by the
/// sandbox user so in-container code can rewrite it.
fn build_file_archive(name: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(1000);
    header.set_gid(1000);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    builder.append_data(&mut header, name, data)?;
    builder.into_inner()
}
