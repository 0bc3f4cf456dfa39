//! Session identity consumed by both duplex channels.
//!
//! The channels only read these values at connect time; how the session id
//! is created and persisted is the concern of the [`SessionIdentity`]
//! implementation.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable holding an optional auth bearer token.
pub const AUTH_TOKEN_ENV: &str = "CONCIERGE_AUTH_TOKEN";

/// Supplies the opaque session token and optional bearer token.
pub trait SessionIdentity: Send + Sync {
    /// Session id shared by the audio and text channels.
    fn session_id(&self) -> String;

    /// Auth bearer token, when the user is signed in.
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed session values.
#[derive(Debug, Clone)]
pub struct StaticSession {
    session_id: String,
    bearer_token: Option<String>,
}

impl StaticSession {
    pub fn new(session_id: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            bearer_token,
        }
    }
}

impl SessionIdentity for StaticSession {
    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    fn bearer_token(&self) -> Option<String> {
        self.bearer_token.clone()
    }
}

/// Session id persisted in a single file, created on first use.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    session_id: String,
    bearer_token: Option<String>,
}

impl FileSessionStore {
    /// Load the session id from `path`, generating and saving a new one if
    /// the file is missing or empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let existing = match std::fs::read_to_string(path) {
            Ok(raw) => Some(raw.trim().to_owned()).filter(|id| !id.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let session_id = match existing {
            Some(id) => id,
            None => {
                let id = format!("session_{}", uuid::Uuid::new_v4().simple());
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, &id)?;
                info!("created new session id at {}", path.display());
                id
            }
        };

        let bearer_token = std::env::var(AUTH_TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());

        Ok(Self {
            session_id,
            bearer_token,
        })
    }

    /// Default location: `<data dir>/concierge/session_id`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("concierge")
            .join("session_id")
    }
}

impl SessionIdentity for FileSessionStore {
    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    fn bearer_token(&self) -> Option<String> {
        self.bearer_token.clone()
    }
}
