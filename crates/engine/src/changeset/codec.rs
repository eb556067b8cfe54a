//! Change set encoding for cache synchronization
//!
//! Distribution change sets are shipped between cooperating caches as
//! MessagePack (`rmp-serde`). Only the object change sets travel; the
//! key index is rebuilt on decode and working-copy handles are never sent.

use coherence_core::{CoherenceError, SessionId};
use serde::{Deserialize, Serialize};

use crate::changeset::object::ObjectChangeSet;
use crate::changeset::unit::UnitOfWorkChangeSet;

/// Errors from change set encoding and decoding
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChangeSetCodecError {
    /// Serialization failed
    #[error("Failed to encode change set: {0}")]
    EncodeFailed(String),
    /// Bytes are not a valid MessagePack change set
    #[error("Failed to decode change set: {0}")]
    DecodeFailed(String),
    /// Decoded change set references objects it does not contain
    #[error("Corrupt change set: {0}")]
    Corrupt(String),
}

impl From<ChangeSetCodecError> for CoherenceError {
    fn from(e: ChangeSetCodecError) -> Self {
        CoherenceError::Serialization {
            message: e.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireChangeSet {
    origin: SessionId,
    objects: Vec<ObjectChangeSet>,
}

impl UnitOfWorkChangeSet {
    /// Serialize to MessagePack bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChangeSetCodecError> {
        let wire = WireChangeSet {
            origin: self.origin,
            objects: self.objects.clone(),
        };
        rmp_serde::to_vec(&wire).map_err(|e| ChangeSetCodecError::EncodeFailed(e.to_string()))
    }

    /// Deserialize from MessagePack bytes
    ///
    /// # Errors
    ///
    /// `DecodeFailed` for malformed bytes, `Corrupt` when ids are out of
    /// order or a record references a missing change set.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChangeSetCodecError> {
        let wire: WireChangeSet = rmp_serde::from_slice(bytes)
            .map_err(|e| ChangeSetCodecError::DecodeFailed(e.to_string()))?;

        let len = wire.objects.len();
        for (i, object) in wire.objects.iter().enumerate() {
            if object.id.index() != i {
                return Err(ChangeSetCodecError::Corrupt(format!(
                    "change set at position {} has id {}",
                    i, object.id
                )));
            }
            if let Some(bad) = object
                .referenced_change_sets()
                .into_iter()
                .find(|r| r.index() >= len)
            {
                return Err(ChangeSetCodecError::Corrupt(format!(
                    "{} references missing change set {}",
                    object.id, bad
                )));
            }
        }
        Ok(UnitOfWorkChangeSet::from_parts(wire.origin, wire.objects))
    }
}
