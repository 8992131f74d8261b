//! Persisted session profile: API key + minimal user identity.
//!
//! This is the ONLY client-side state that survives a restart.  Everything
//! else (feeds, alerts, notifications) is rebuilt from a fresh snapshot and
//! a fresh stream connection, so a stale profile can never smuggle stale
//! synchronization state into a new session.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// API key presented on snapshot requests and in the `authenticate` frame.
    pub token: String,
    /// Display identity reported to the backend.
    pub user: String,
}

impl Profile {
    /// Both fields must be non-blank before a connection is attempted.
    pub fn has_credentials(&self) -> bool {
        !self.token.trim().is_empty() && !self.user.trim().is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Default profile location under the platform data dir.
pub fn default_profile_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("metrowatch")
        .join("console")
        .join("profile.json")
}

/// Load the profile, returning `None` when the file does not exist.
pub fn load_profile(path: &Path) -> Result<Option<Profile>, ProfileError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Save the profile, creating parent directories as needed.
pub fn save_profile(path: &Path, profile: &Profile) -> Result<(), ProfileError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(profile)?;
    std::fs::write(path, text)?;
    Ok(())
}
