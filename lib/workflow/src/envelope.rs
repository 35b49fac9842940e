//! Versioned envelope for persisted records.
//!
//! Checkpoints and approval records are written as
//! `{"version": N, "payload": ...}` so that a reader can refuse formats it
//! does not understand instead of misreading them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The envelope version this build writes and reads.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned wrapper around a persisted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the payload format.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload with the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }
}

/// Why an envelope could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The bytes are not an envelope, or the payload does not fit.
    Malformed { reason: String },
    /// Written by an incompatible version.
    UnsupportedVersion { version: u32 },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed record: {reason}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported record version {version} (expected {CURRENT_VERSION})")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Serializes a payload inside a current-version envelope.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn seal<T: Serialize>(payload: &T) -> Result<Vec<u8>, EnvelopeError> {
    serde_json::to_vec_pretty(&Envelope::new(payload)).map_err(|e| EnvelopeError::Malformed {
        reason: e.to_string(),
    })
}

/// Opens an envelope, checking the version before decoding the payload.
///
/// # Errors
///
/// Returns an error for other versions or undecodable bytes.
pub fn open<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    let raw: Envelope<serde_json::Value> =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed {
            reason: e.to_string(),
        })?;
    if raw.version != CURRENT_VERSION {
        return Err(EnvelopeError::UnsupportedVersion {
            version: raw.version,
        });
    }
    serde_json::from_value(raw.payload).map_err(|e| EnvelopeError::Malformed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        message: String,
        count: u32,
    }

    #[test]
    fn sealed_records_carry_the_version() {
        let bytes = seal(&Record {
            message: "hello".to_string(),
            count: 42,
        })
        .expect("seal");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["version"], CURRENT_VERSION);
        assert_eq!(value["payload"]["count"], 42);

        let record: Record = open(&bytes).expect("open");
        assert_eq!(record.message, "hello");
    }

    #[test]
    fn other_versions_are_refused() {
        let bytes = serde_json::to_vec(&json!({"version": 7, "payload": {}})).expect("json");
        assert_eq!(
            open::<Record>(&bytes).unwrap_err(),
            EnvelopeError::UnsupportedVersion { version: 7 }
        );
    }

    #[test]
    fn bare_payloads_are_malformed() {
        let bytes = br#"{"message": "x", "count": 1}"#;
        assert!(matches!(
            open::<Record>(bytes),
            Err(EnvelopeError::Malformed { .. })
        ));
    }
}
