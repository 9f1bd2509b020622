//! Checksummed on-disk representation of a [`Session`].
//!
//! Every persisted copy (primary record or backup replica) is a
//! `SessionEnvelope`, so each one can be verified on its own.

use relink_core::Session;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ENVELOPE_FORMAT: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Malformed(String),
    #[error("unsupported envelope format {0}")]
    UnsupportedFormat(u32),
    #[error("payload checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("payload does not hold session {expected}")]
    SessionMismatch { expected: String },
    #[error("failed encoding session: {0}")]
    Encode(String),
}

/// Serialized session plus the metadata needed to verify it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEnvelope {
    pub format: u32,
    pub session_id: String,
    pub sealed_at_ms: u64,
    /// Hex SHA-256 of `payload`.
    pub checksum: String,
    /// Session JSON.
    pub payload: String,
}

impl SessionEnvelope {
    pub fn seal(session: &Session, sealed_at_ms: u64) -> Result<Self, EnvelopeError> {
        let payload =
            serde_json::to_string(session).map_err(|err| EnvelopeError::Encode(err.to_string()))?;
        Ok(Self {
            format: ENVELOPE_FORMAT,
            session_id: session.id.clone(),
            sealed_at_ms,
            checksum: payload_checksum(&payload),
            payload,
        })
    }

    /// Verify the envelope and decode the session it carries.
    pub fn open(&self) -> Result<Session, EnvelopeError> {
        if self.format != ENVELOPE_FORMAT {
            return Err(EnvelopeError::UnsupportedFormat(self.format));
        }
        let actual = payload_checksum(&self.payload);
        if actual != self.checksum {
            return Err(EnvelopeError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        let session = serde_json::from_str::<Session>(&self.payload)
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        if session.id != self.session_id {
            return Err(EnvelopeError::SessionMismatch {
                expected: self.session_id.clone(),
            });
        }
        Ok(session)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec_pretty(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|err| EnvelopeError::Malformed(err.to_string()))
    }
}

/// A session together with the exact envelope it was sealed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSession {
    pub session: Session,
    pub envelope: SessionEnvelope,
}

impl SealedSession {
    pub fn seal(session: Session, sealed_at_ms: u64) -> Result<Self, EnvelopeError> {
        let envelope = SessionEnvelope::seal(&session, sealed_at_ms)?;
        Ok(Self { session, envelope })
    }

    /// Decode and verify raw envelope bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope = SessionEnvelope::from_bytes(bytes)?;
        let session = envelope.open()?;
        Ok(Self { session, envelope })
    }

    pub fn checksum(&self) -> &str {
        &self.envelope.checksum
    }
}

pub fn payload_checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(vec![0xde, 0xad, 0xbe, 0xef], "device-1", 1_700_000_000_000)
    }

    #[test]
    fn sealed_envelope_opens_to_same_session() {
        let session = session();
        let envelope = SessionEnvelope::seal(&session, 42).expect("seal");
        assert_eq!(envelope.checksum.len(), 64);

        let bytes = envelope.to_bytes().expect("encode");
        let decoded = SealedSession::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.session, session);
        assert_eq!(decoded.envelope, envelope);
    }

    #[test]
    fn detects_tampered_payload() {
        let mut envelope = SessionEnvelope::seal(&session(), 42).expect("seal");
        envelope.payload = envelope.payload.replace("device-1", "device-2");

        let err = envelope.open().expect_err("tampered payload");
        assert!(matches!(err, EnvelopeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn detects_truncated_bytes() {
        let bytes = SessionEnvelope::seal(&session(), 42)
            .expect("seal")
            .to_bytes()
            .expect("encode");
        let err = SealedSession::from_bytes(&bytes[..bytes.len() / 2]).expect_err("truncated");
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn rejects_unknown_format() {
        let mut envelope = SessionEnvelope::seal(&session(), 42).expect("seal");
        envelope.format = 9;
        assert_eq!(
            envelope.open().expect_err("future format"),
            EnvelopeError::UnsupportedFormat(9)
        );
    }

    #[test]
    fn rejects_payload_for_other_session() {
        let mut envelope = SessionEnvelope::seal(&session(), 42).expect("seal");
        envelope.session_id = "someone-else".into();
        assert!(matches!(
            envelope.open().expect_err("id mismatch"),
            EnvelopeError::SessionMismatch { .. }
        ));
    }
}
