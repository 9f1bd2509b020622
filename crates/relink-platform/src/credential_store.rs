//! Primary session record persistence.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use relink_core::Session;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    atomic_file::{read_optional, remove_if_exists, write_atomic},
    envelope::{EnvelopeError, SealedSession},
    secret::{SecretStore, SecretStoreError},
};

const ARCHIVE_DIR: &str = "archive";
const PRIMARY_ACCOUNT: &str = "session";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialStoreError {
    /// Stored record exists but fails structural or checksum validation.
    #[error("stored session is corrupt: {0}")]
    CorruptData(String),
    /// Backend read/write failure; callers may retry.
    #[error("credential store I/O failure: {0}")]
    Io(String),
}

impl CredentialStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CorruptData(_) => "corrupt_data",
            Self::Io(_) => "io_error",
        }
    }
}

impl From<EnvelopeError> for CredentialStoreError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Encode(message) => Self::Io(message),
            other => Self::CorruptData(other.to_string()),
        }
    }
}

/// Durable home of the single primary session record.
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored.
    fn load_sealed(&self) -> Result<Option<SealedSession>, CredentialStoreError>;

    /// Atomically replace the stored record.
    fn save(&self, sealed: &SealedSession) -> Result<(), CredentialStoreError>;

    /// Remove the stored record. Clearing an empty store succeeds.
    fn clear(&self) -> Result<(), CredentialStoreError>;

    /// Move the stored record aside instead of deleting it.
    ///
    /// Returns `false` when there was nothing to archive.
    fn archive(&self, archived_at_ms: u64) -> Result<bool, CredentialStoreError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;

    fn load(&self) -> Result<Option<Session>, CredentialStoreError> {
        Ok(self.load_sealed()?.map(|sealed| sealed.session))
    }
}

/// Stores the envelope as a JSON file, archiving into `archive/` beside it.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(ARCHIVE_DIR)
    }

    fn io_error(&self, action: &str, err: io::Error) -> CredentialStoreError {
        CredentialStoreError::Io(format!("failed {action} {}: {err}", self.path.display()))
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_sealed(&self) -> Result<Option<SealedSession>, CredentialStoreError> {
        let Some(bytes) = read_optional(&self.path).map_err(|err| self.io_error("reading", err))?
        else {
            return Ok(None);
        };
        let sealed = SealedSession::from_bytes(&bytes).map_err(|err| {
            CredentialStoreError::CorruptData(format!("{}: {err}", self.path.display()))
        })?;
        Ok(Some(sealed))
    }

    fn save(&self, sealed: &SealedSession) -> Result<(), CredentialStoreError> {
        let bytes = sealed.envelope.to_bytes()?;
        write_atomic(&self.path, &bytes).map_err(|err| self.io_error("writing", err))?;
        debug!(path = %self.path.display(), session_id = %sealed.session.id, "session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialStoreError> {
        let removed = remove_if_exists(&self.path).map_err(|err| self.io_error("deleting", err))?;
        if removed {
            info!(path = %self.path.display(), "stored session cleared");
        }
        Ok(())
    }

    fn archive(&self, archived_at_ms: u64) -> Result<bool, CredentialStoreError> {
        if !self.path.exists() {
            return Ok(false);
        }
        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir)
            .map_err(|err| self.io_error("creating archive directory for", err))?;

        let stem = self
            .path
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("session");
        let target = archive_dir.join(format!("{stem}-{archived_at_ms}.json"));
        match fs::rename(&self.path, &target) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(self.io_error("archiving", err)),
        }
        info!(from = %self.path.display(), to = %target.display(), "session archived");
        Ok(true)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Stores the envelope in a [`SecretStore`] under one service name.
#[derive(Clone)]
pub struct SecretCredentialStore<S: SecretStore> {
    inner: S,
    service: String,
}

impl<S: SecretStore> SecretCredentialStore<S> {
    pub fn new(inner: S, service: impl Into<String>) -> Self {
        Self {
            inner,
            service: service.into(),
        }
    }

    pub fn archive_account(session_id: &str, archived_at_ms: u64) -> String {
        format!("{ARCHIVE_DIR}/{session_id}/{archived_at_ms}")
    }

    fn load_raw(&self) -> Result<Option<String>, CredentialStoreError> {
        match self.inner.get_secret(&self.service, PRIMARY_ACCOUNT) {
            Ok(raw) => Ok(Some(raw)),
            Err(SecretStoreError::NotFound) => Ok(None),
            Err(err) => Err(CredentialStoreError::Io(err.to_string())),
        }
    }
}

impl<S: SecretStore> CredentialStore for SecretCredentialStore<S> {
    fn load_sealed(&self) -> Result<Option<SealedSession>, CredentialStoreError> {
        let Some(raw) = self.load_raw()? else {
            return Ok(None);
        };
        Ok(Some(SealedSession::from_bytes(raw.as_bytes())?))
    }

    fn save(&self, sealed: &SealedSession) -> Result<(), CredentialStoreError> {
        let bytes = sealed.envelope.to_bytes()?;
        let raw =
            String::from_utf8(bytes).map_err(|err| CredentialStoreError::Io(err.to_string()))?;
        self.inner
            .set_secret(&self.service, PRIMARY_ACCOUNT, &raw)
            .map_err(|err| CredentialStoreError::Io(err.to_string()))
    }

    fn clear(&self) -> Result<(), CredentialStoreError> {
        match self.inner.delete_secret(&self.service, PRIMARY_ACCOUNT) {
            Ok(()) | Err(SecretStoreError::NotFound) => Ok(()),
            Err(err) => Err(CredentialStoreError::Io(err.to_string())),
        }
    }

    fn archive(&self, archived_at_ms: u64) -> Result<bool, CredentialStoreError> {
        let Some(raw) = self.load_raw()? else {
            return Ok(false);
        };
        // Corrupt records are archived as-is under a placeholder id.
        let session_id = SealedSession::from_bytes(raw.as_bytes())
            .map(|sealed| sealed.session.id)
            .unwrap_or_else(|_| "unreadable".to_owned());
        let account = Self::archive_account(&session_id, archived_at_ms);
        self.inner
            .set_secret(&self.service, &account, &raw)
            .map_err(|err| CredentialStoreError::Io(err.to_string()))?;
        self.clear()?;
        info!(service = %self.service, %account, "session archived");
        Ok(true)
    }

    fn describe(&self) -> String {
        format!("secret:{}", self.service)
    }
}
