// Ledger record serialization using MessagePack

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::LedgerError;

/// Serialization format version for schema evolution
const SERIALIZATION_VERSION: u8 = 1;

#[derive(Serialize)]
struct VersionedRecord<'a, T> {
    version: u8,
    record: &'a T,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u8,
}

#[derive(Deserialize)]
struct OwnedRecord<T> {
    record: T,
}

/// Encode a record with a version marker.
///
/// Records are written as MessagePack maps (named fields) because several
/// model fields are skipped when empty, which positional encoding cannot
/// represent.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, LedgerError> {
    let versioned = VersionedRecord {
        version: SERIALIZATION_VERSION,
        record,
    };
    rmp_serde::to_vec_named(&versioned)
        .map_err(|e| LedgerError::Serialization(format!("MessagePack encoding failed: {}", e)))
}

/// Decode a record written by [`encode`], rejecting other schema versions
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LedgerError> {
    let probe: VersionProbe = rmp_serde::from_slice(bytes)
        .map_err(|e| LedgerError::Serialization(format!("MessagePack decoding failed: {}", e)))?;

    if probe.version != SERIALIZATION_VERSION {
        return Err(LedgerError::UnsupportedVersion {
            found: probe.version,
            expected: SERIALIZATION_VERSION,
        });
    }

    let owned: OwnedRecord<T> = rmp_serde::from_slice(bytes)
        .map_err(|e| LedgerError::Serialization(format!("MessagePack decoding failed: {}", e)))?;
    Ok(owned.record)
}
