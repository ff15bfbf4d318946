//! Usage: Durable mirror of the session token pair (JSON file store + in-memory store).
//!
//! The session calls into a [`TokenStore`] on every `set_tokens`/`clear` so a
//! restarted process can resume without a fresh login. Tokens are written in
//! plain JSON; protecting the file is the embedding application's concern.

use crate::shared::lock_ext::MutexExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub saved_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("STORE_IO_ERROR: {context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("STORE_FORMAT_ERROR: {0}")]
    Format(String),
}

pub trait TokenStore: Send + Sync + std::fmt::Debug {
    fn load(&self) -> Result<Option<StoredTokens>, StoreError>;
    fn save(&self, tokens: &StoredTokens) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, context: &'static str, source: std::io::Error) -> StoreError {
        StoreError::Io {
            context,
            path: self.path.clone(),
            source,
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "tokens.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<StoredTokens>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_err("read token file", err)),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let tokens: StoredTokens = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Format(format!("token file json invalid: {e}")))?;
        if tokens.access_token.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(tokens))
    }

    fn save(&self, tokens: &StoredTokens) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err("create token dir", e))?;
        }

        let encoded = serde_json::to_vec_pretty(tokens)
            .map_err(|e| StoreError::Format(format!("token json encode failed: {e}")))?;

        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = self.tmp_path();
        std::fs::write(&tmp, encoded).map_err(|e| self.io_err("write token tmp file", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| self.io_err("chmod token tmp file", e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err("replace token file", e))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_err("remove token file", err)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: Mutex<Option<StoredTokens>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: StoredTokens) -> Self {
        Self {
            inner: Mutex::new(Some(tokens)),
        }
    }

    pub fn current(&self) -> Option<StoredTokens> {
        self.inner.lock_or_recover().clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<StoredTokens>, StoreError> {
        Ok(self.current())
    }

    fn save(&self, tokens: &StoredTokens) -> Result<(), StoreError> {
        *self.inner.lock_or_recover() = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.inner.lock_or_recover() = None;
        Ok(())
    }
}
