//! Persistence side of the lifecycle manager: the primary credential record,
//! secret-store backends, redundant backups and session leases.

mod atomic_file;
pub mod backup;
pub mod credential_store;
pub mod envelope;
pub mod lease;
pub mod secret;

pub use backup::{BackupError, BackupManager};
pub use credential_store::{
    CredentialStore, CredentialStoreError, FileCredentialStore, SecretCredentialStore,
};
pub use envelope::{EnvelopeError, SealedSession, SessionEnvelope};
pub use lease::{InProcessLease, LeaseError, LeaseGuard, SessionLease};
#[cfg(feature = "os-keyring")]
pub use secret::OsKeyringSecretStore;
pub use secret::{InMemorySecretStore, SecretStore, SecretStoreError};
