//! Agent credentials and password rotation.
//!
//! An agent starts life with an initial password handed out at provisioning
//! time. On first contact it replaces that password with one it generated
//! itself, so the initial password never stays the live secret.
//!
//! Rotation has to survive a crash at any point:
//!
//! 1. The new password is persisted locally before the store is told about it
//! 2. The initial password is kept in the credential file indefinitely
//! 3. If the persisted password is rejected, the initial one is tried again
//!    and a fresh password is generated
//!
//! So if the process dies between steps, the store still accepts the initial
//! password and the next run repeats the rotation.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use fleet_id::EntityTag;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::state::{StateConnector, StateStore, StoreError};

/// Random bytes in a generated password.
const PASSWORD_BYTES: usize = 18;

/// Credential file name inside an agent's directory.
const CREDENTIAL_FILE: &str = "credential.json";

/// Errors from credential persistence.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential stored for {0}")]
    NotFound(EntityTag),

    #[error("credential file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("credential io error: {0}")]
    Io(#[from] io::Error),
}

/// The secrets an agent authenticates with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCredential {
    pub tag: EntityTag,

    /// Password the agent generated for itself, once rotated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Initial password. Kept so an interrupted rotation can be repeated.
    pub old_password: String,

    pub updated_at: DateTime<Utc>,
}

impl EntityCredential {
    /// A credential holding only the initial password.
    pub fn initial(tag: EntityTag, password: impl Into<String>) -> Self {
        Self {
            tag,
            password: None,
            old_password: password.into(),
            updated_at: Utc::now(),
        }
    }

    /// This credential with `password` as the agent's own password.
    pub fn rotated(&self, password: impl Into<String>) -> Self {
        Self {
            tag: self.tag.clone(),
            password: Some(password.into()),
            old_password: self.old_password.clone(),
            updated_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for EntityCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCredential")
            .field("tag", &self.tag)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("old_password", &"<redacted>")
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Durable credential storage.
pub trait CredentialStore: Send + Sync {
    fn load(&self, tag: &EntityTag) -> Result<EntityCredential, CredentialError>;

    /// Replace the stored credential. Must be atomic.
    fn save(&self, credential: &EntityCredential) -> Result<(), CredentialError>;
}

// =============================================================================
// File Store
// =============================================================================

/// Credentials as JSON files under `<data-dir>/agents/<tag>/`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("agents"),
        }
    }

    pub fn path(&self, tag: &EntityTag) -> PathBuf {
        self.root.join(tag.to_string()).join(CREDENTIAL_FILE)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, tag: &EntityTag) -> Result<EntityCredential, CredentialError> {
        let content = match fs::read(self.path(tag)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(tag.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    /// Writes to a temp file, fsyncs, then renames over the old file.
    fn save(&self, credential: &EntityCredential) -> Result<(), CredentialError> {
        let path = self.path(&credential.tag);
        let content = serde_json::to_vec_pretty(credential)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp_path)?;

            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)?;

        debug!(tag = %credential.tag, path = %path.display(), "Credential saved");
        Ok(())
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// Generate a fresh random password.
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// An open connection, plus the password that must replace the current one.
pub struct Authenticated {
    pub store: Arc<dyn StateStore>,

    /// Set when the connection was opened with the initial password. The
    /// caller persists it before using the connection, then installs it.
    pub new_password: Option<String>,
}

/// Open a state connection for `credential`.
pub async fn authenticate(
    connector: &dyn StateConnector,
    credential: &EntityCredential,
) -> Result<Authenticated, StoreError> {
    if let Some(password) = &credential.password {
        match connector.connect(&credential.tag, password).await {
            Ok(store) => {
                return Ok(Authenticated {
                    store,
                    new_password: None,
                });
            }
            Err(e) if e.is_unauthorized() => {
                info!(tag = %credential.tag, "Password rejected, retrying with initial password");
            }
            Err(e) => return Err(e),
        }
    }

    let store = connector
        .connect(&credential.tag, &credential.old_password)
        .await?;
    Ok(Authenticated {
        store,
        new_password: Some(generate_password()),
    })
}
