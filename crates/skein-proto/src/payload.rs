//! CBOR helpers for typed payloads.
//!
//! The envelope treats payloads as opaque bytes. Applications that register
//! typed handlers encode their messages with CBOR through these helpers so
//! both ends agree on one self-describing format.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{ProtocolError, Result};

/// Encode a value as a CBOR payload.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a CBOR payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        room: String,
        body: String,
    }

    #[test]
    fn cbor_roundtrip() {
        let chat = Chat { room: "lobby".into(), body: "hi".into() };
        let bytes = encode_payload(&chat).unwrap();
        let back: Chat = decode_payload(&bytes).unwrap();
        assert_eq!(back, chat);
    }

    #[test]
    fn wrong_shape_is_decode_error() {
        let bytes = encode_payload(&42u32).unwrap();
        let result: Result<Chat> = decode_payload(&bytes);
        assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
    }
}
