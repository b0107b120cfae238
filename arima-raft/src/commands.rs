//! Command payloads and apply responses.
//!
//! Every client operation is encoded as a [`Command`], carried as the opaque
//! data of a replicated log entry, and decoded again by the state machine
//! once the entry is committed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::ArimaError;

/// A command proposed through consensus and applied to the state machine.
///
/// On the wire this is a MessagePack map
/// `{"operation": "set" | "delete" | "get", "key": bin, "value": bin}`;
/// only `set` carries a value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum Command {
    /// Upsert `key -> value`. The value may be empty.
    Set {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },

    /// Remove `key`. Removing an absent key is not an error.
    Delete {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },

    /// Read `key` through the replicated log. Does not mutate state.
    Get {
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
}

impl Command {
    pub fn key(&self) -> &[u8] {
        match self {
            Command::Set { key, .. } | Command::Delete { key } | Command::Get { key } => key,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Delete { .. } => "delete",
            Command::Get { .. } => "get",
        }
    }
}

/// Why a committed entry could not be applied. Carried back to the submitter;
/// it never vetoes commitment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("key not found")]
    NotFound,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("malformed command payload: {0}")]
    Encoding(String),

    #[error("state machine unavailable: {0}")]
    Unavailable(String),
}

impl From<ArimaError> for ApplyError {
    fn from(err: ArimaError) -> Self {
        match err {
            ArimaError::NotFound => ApplyError::NotFound,
            ArimaError::Encoding(msg) => ApplyError::Encoding(msg),
            ArimaError::Unavailable(msg) => ApplyError::Unavailable(msg),
            ArimaError::Apply(inner) => inner,
            other => ApplyError::Storage(other.to_string()),
        }
    }
}

/// Response returned after applying a single entry. Not persisted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyResponse {
    pub error: Option<ApplyError>,
    pub data: Option<Vec<u8>>,
}

impl ApplyResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            error: None,
            data: Some(data),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn failed(error: ApplyError) -> Self {
        Self {
            error: Some(error),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a plain `Result`, surfacing the apply error.
    pub fn into_result(self) -> Result<Option<Vec<u8>>, ApplyError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_command, encode_command};
    use serde_bytes::ByteBuf;

    /// Loose view of a payload map, for building and inspecting raw bytes.
    #[derive(Serialize, Deserialize, Debug)]
    struct RawCommand {
        operation: String,
        key: ByteBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<ByteBuf>,
    }

    fn raw(operation: &str, key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
        let raw = RawCommand {
            operation: operation.into(),
            key: ByteBuf::from(key),
            value: value.map(ByteBuf::from),
        };
        rmp_serde::to_vec_named(&raw).unwrap()
    }

    #[test]
    fn wire_shape_is_operation_tagged_binary_map() {
        let cmd = Command::Set {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        };
        let bytes = encode_command(&cmd).unwrap();
        let seen: RawCommand = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(seen.operation, "set");
        assert_eq!(seen.key.as_slice(), b"a");
        assert_eq!(seen.value.as_deref().map(|v| v.as_slice()), Some(&b"1"[..]));
        // fixmap header, then named fields rather than a positional array
        assert_eq!(bytes[0] & 0xF0, 0x80);
    }

    #[test]
    fn delete_decodes_without_value_and_ignores_stray_one() {
        let cmd = decode_command(&raw("delete", b"a", Some(&[1]))).unwrap();
        assert_eq!(cmd, Command::Delete { key: b"a".to_vec() });
    }

    #[test]
    fn set_without_value_is_rejected() {
        assert!(decode_command(&raw("set", b"a", None)).is_err());
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(decode_command(&raw("merge", b"a", None)).is_err());
    }

    #[test]
    fn empty_value_survives_encoding() {
        let cmd = Command::Set {
            key: b"k".to_vec(),
            value: Vec::new(),
        };
        assert_eq!(decode_command(&encode_command(&cmd).unwrap()).unwrap(), cmd);
    }

    #[test]
    fn storage_errors_map_onto_apply_errors() {
        assert_eq!(ApplyError::from(ArimaError::NotFound), ApplyError::NotFound);
        assert!(matches!(
            ApplyError::from(ArimaError::Encoding("bad".into())),
            ApplyError::Encoding(_)
        ));
        assert!(matches!(
            ApplyError::from(ArimaError::Io(std::io::Error::other("disk"))),
            ApplyError::Storage(_)
        ));
    }
}
