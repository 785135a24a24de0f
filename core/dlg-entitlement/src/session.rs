//! Local session persistence for silent re-authentication.
//!
//! One JSON record per installation holds the last successful login. The
//! record is bound to the device fingerprint and carries a checksum over
//! `user_id:email:device_fingerprint:secret`; a record that fails either
//! check is deleted, never trusted.
//!
//! Writes go to a temp file in the same directory which is then renamed
//! over the old record, so a reader never sees a half-written file.

use crate::entitlement::parse_timestamp;
use crate::error::{EntitlementError, EntitlementResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// File name of the session record inside the data directory.
pub const SESSION_FILE: &str = "session.json";

/// The persisted snapshot of the last successful authentication.
///
/// Unknown fields are ignored on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedSession {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub avatar: String,
    pub device_fingerprint: String,
    pub plan_name: String,
    pub expires_at: String,
    pub is_trial: bool,
    /// RFC 3339 timestamp of the write.
    pub saved_at: String,
    pub checksum: String,
}

impl PersistedSession {
    /// Recomputes the checksum over the identity fields.
    #[must_use]
    pub fn compute_checksum(&self, secret: &str) -> String {
        checksum(&self.user_id, &self.email, &self.device_fingerprint, secret)
    }

    /// Returns true if the record may be trusted on the given device.
    ///
    /// A record with an empty stored fingerprint is accepted on any device;
    /// records written by this crate always carry one.
    #[must_use]
    pub fn verify(&self, current_fingerprint: &str, secret: &str) -> bool {
        if self.device_fingerprint.is_empty() {
            warn!("session record has no device fingerprint, accepting it unbound");
        } else if self.device_fingerprint != current_fingerprint {
            warn!("session record belongs to another device");
            return false;
        }

        if self.checksum != self.compute_checksum(secret) {
            warn!("session record checksum mismatch");
            return false;
        }
        true
    }

    /// Parsed `saved_at`; older records may carry a naive timestamp.
    #[must_use]
    pub fn saved_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.saved_at)
    }

    fn has_identity(&self) -> bool {
        !self.user_id.trim().is_empty() && !self.email.trim().is_empty()
    }
}

/// Fields of a session to save; the store adds `saved_at` and the checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDraft {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub avatar: String,
    pub device_fingerprint: String,
    pub plan_name: String,
    pub expires_at: String,
    pub is_trial: bool,
}

/// One-way digest binding a session to a user and a device.
#[must_use]
pub fn checksum(user_id: &str, email: &str, device_fingerprint: &str, secret: &str) -> String {
    let data = format!("{user_id}:{email}:{device_fingerprint}:{secret}");
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Owner of the on-disk session record.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    secret: String,
    current: Option<PersistedSession>,
}

impl SessionStore {
    /// Opens the store at `path` and loads any existing record.
    pub fn open(path: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        let mut store = Self {
            path: path.into(),
            secret: secret.into(),
            current: None,
        };
        store.load();
        store
    }

    /// Path of the session file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The record loaded from disk, if any.
    #[must_use]
    pub fn session(&self) -> Option<&PersistedSession> {
        self.current.as_ref()
    }

    /// Returns true if a record is loaded.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.current.is_some()
    }

    /// Re-reads the record from disk.
    ///
    /// A missing file, unreadable JSON, or a record without user id or
    /// email all count as "no session".
    pub fn load(&mut self) -> Option<&PersistedSession> {
        self.current = read_record(&self.path);
        if let Some(session) = &self.current {
            debug!(user_id = %session.user_id, "session loaded");
        }
        self.current.as_ref()
    }

    /// Saves a new record, replacing the old one wholesale.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the file cannot be written.
    pub fn save(&mut self, draft: SessionDraft) -> EntitlementResult<&PersistedSession> {
        let mut session = PersistedSession {
            user_id: draft.user_id,
            email: draft.email,
            name: draft.name,
            avatar: draft.avatar,
            device_fingerprint: draft.device_fingerprint,
            plan_name: draft.plan_name,
            expires_at: draft.expires_at,
            is_trial: draft.is_trial,
            saved_at: Utc::now().to_rfc3339(),
            checksum: String::new(),
        };
        session.checksum = session.compute_checksum(&self.secret);

        let json = serde_json::to_string_pretty(&session)?;
        atomic_write(&self.path, &json)?;

        info!(user_id = %session.user_id, "session saved");
        let saved = self.current.insert(session);
        Ok(&*saved)
    }

    /// Deletes the record. Clearing an absent record succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&mut self) -> EntitlementResult<()> {
        self.current = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("session cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EntitlementError::Storage(format!(
                "removing {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Checks the loaded record against the current device.
    ///
    /// Fails if no record is loaded, if the stored fingerprint is set and
    /// differs from `current_fingerprint`, or if the checksum disagrees.
    #[must_use]
    pub fn verify_integrity(&self, current_fingerprint: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|s| s.verify(current_fingerprint, &self.secret))
    }
}

fn read_record(path: &Path) -> Option<PersistedSession> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("failed to read session file {}: {e}", path.display());
            return None;
        }
    };

    match serde_json::from_str::<PersistedSession>(&content) {
        Ok(session) if session.has_identity() => Some(session),
        Ok(_) => {
            debug!("session record lacks user id or email, ignoring");
            None
        }
        Err(e) => {
            warn!("failed to parse session file {}: {e}", path.display());
            None
        }
    }
}

/// Writes content to a file atomically using temp file + rename.
fn atomic_write(path: &Path, contents: &str) -> EntitlementResult<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| {
        EntitlementError::Storage(format!("creating {}: {e}", dir.display()))
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| {
        EntitlementError::Storage(format!("creating temp file in {}: {e}", dir.display()))
    })?;
    tmp.write_all(contents.as_bytes())
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| {
            EntitlementError::Storage(format!("writing temp file for {}: {e}", path.display()))
        })?;
    tmp.persist(path).map_err(|e| {
        EntitlementError::Storage(format!("persisting {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
