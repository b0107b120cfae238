//! Byte encodings shared by the stores and the state machine.
//!
//! - Log indices and integer metadata use a fixed 8-byte big-endian form, so
//!   numeric order equals byte-lexicographic order in the storage engine.
//! - Command payloads use MessagePack with named fields: a compact binary
//!   map that stays self-describing and tolerates added fields.
//! - Stable metadata (votes, log ids) and cluster configurations use
//!   `serde_json`.
//! - Internal records (log entries, applied marks) use `bincode`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::commands::Command;
use crate::errors::{ArimaError, Result};

/// Encode `value` as an ordered 8-byte key.
pub fn u64_to_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decode an 8-byte big-endian key. Any other length is malformed.
pub fn key_to_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| {
        ArimaError::Encoding(format!("expected 8 bytes, got {}", bytes.len()))
    })?;
    Ok(u64::from_be_bytes(raw))
}

pub fn encode_command(cmd: &Command) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(cmd)?)
}

pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    Ok(rmp_serde::from_slice(bytes)?)
}

pub fn encode_meta<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_meta<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_keys_sort_numerically() {
        let mut keys: Vec<[u8; 8]> = [300u64, 2, 1 << 40, 256, 0]
            .into_iter()
            .map(u64_to_key)
            .collect();
        keys.sort();

        let decoded: Vec<u64> = keys.iter().map(|k| key_to_u64(k).unwrap()).collect();
        assert_eq!(decoded, vec![0, 2, 256, 300, 1 << 40]);
    }

    #[test]
    fn key_of_wrong_width_is_rejected() {
        let err = key_to_u64(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ArimaError::Encoding(_)));
    }

    #[test]
    fn malformed_metadata_is_an_encoding_error() {
        let err = decode_meta::<serde_json::Value>(b"{not json").unwrap_err();
        assert!(matches!(err, ArimaError::Encoding(_)));
    }

    #[test]
    fn malformed_command_is_an_encoding_error() {
        // 0xc1 is never used by MessagePack.
        let err = decode_command(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, ArimaError::Encoding(_)));
    }

    #[test]
    fn command_payload_is_compact() {
        let cmd = Command::Set {
            key: vec![0xAB; 16],
            value: vec![0xCD; 16],
        };
        let bytes = encode_command(&cmd).unwrap();

        assert!(bytes.len() < 64, "payload is {} bytes", bytes.len());
        assert_eq!(decode_command(&bytes).unwrap(), cmd);
    }
}
