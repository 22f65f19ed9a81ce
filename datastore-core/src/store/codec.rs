/*
    codec.rs - Value <-> bytes translation for a store

    A codec is chosen per store and supplies the value used when the store
    file does not exist yet. Decoding never falls back to the default:
    malformed input is reported so the engine can surface corruption.

    BincodeCodec frame layout:
    [magic:4 "DSOB"][version:1][len:4 LE][payload:len][crc32:4 LE]
*/

use crate::store::errors::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Translates a store's value type to and from its on-disk bytes
pub trait Codec: Send + Sync + 'static {
    /// Value type held by stores using this codec
    type Value: Clone + Send + Sync + 'static;

    /// Value used when no file exists yet
    fn default_value(&self) -> Self::Value;

    /// Decode bytes read from disk
    fn decode(&self, bytes: &[u8]) -> Result<Self::Value, CodecError>;

    /// Encode a value for persistence
    fn encode(&self, value: &Self::Value) -> Result<Vec<u8>, CodecError>;
}

const MAGIC: &[u8; 4] = b"DSOB";
const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 4 + 1 + 4;
const TRAILER_SIZE: usize = 4;

/// Codec for structured objects: bincode payload with a checksummed frame
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        BincodeCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BincodeCodec")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static,
{
    type Value = T;

    fn default_value(&self) -> T {
        T::default()
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(CodecError::Malformed(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(CodecError::Malformed("invalid magic header".to_string()));
        }
        let version = bytes[4];
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[5..9]);
        let len = u32::from_le_bytes(len_buf) as usize;
        // The length prefix is untrusted; on 32-bit targets the frame size can overflow.
        let frame_len = len.checked_add(HEADER_SIZE + TRAILER_SIZE);
        if frame_len != Some(bytes.len()) {
            return Err(CodecError::Malformed(format!(
                "length mismatch: header says {} payload bytes, frame holds {}",
                len,
                bytes.len().saturating_sub(HEADER_SIZE + TRAILER_SIZE)
            )));
        }

        let payload = &bytes[HEADER_SIZE..HEADER_SIZE + len];
        let mut crc_buf = [0u8; 4];
        crc_buf.copy_from_slice(&bytes[HEADER_SIZE + len..]);
        let expected = u32::from_le_bytes(crc_buf);
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        Ok(bincode::deserialize(payload)?)
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CodecError::Encode(format!("payload too large: {} bytes", payload.len())))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
        frame.extend_from_slice(MAGIC);
        frame.push(FORMAT_VERSION);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Settings {
        example_counter: i32,
        theme: String,
    }

    fn codec() -> BincodeCodec<Settings> {
        BincodeCodec::new()
    }

    fn sample() -> Settings {
        Settings {
            example_counter: 7,
            theme: "dark".to_string(),
        }
    }

    #[test]
    fn test_default_value() {
        assert_eq!(codec().default_value(), Settings::default());
    }

    #[test]
    fn test_encode_then_decode() {
        let bytes = codec().encode(&sample()).unwrap();
        assert_eq!(&bytes[0..4], MAGIC);
        assert_eq!(codec().decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn test_empty_input_is_malformed() {
        assert!(matches!(codec().decode(&[]), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = codec().encode(&sample()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(codec().decode(&bytes), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_unknown_version() {
        let mut bytes = codec().encode(&sample()).unwrap();
        bytes[4] = 9;
        assert!(matches!(
            codec().decode(&bytes),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_flipped_payload_bit_fails_checksum() {
        let mut bytes = codec().encode(&sample()).unwrap();
        bytes[HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            codec().decode(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_and_trailing_bytes() {
        let bytes = codec().encode(&sample()).unwrap();
        assert!(codec().decode(&bytes[..bytes.len() - 1]).is_err());

        let mut longer = bytes.clone();
        longer.push(0);
        assert!(codec().decode(&longer).is_err());
    }

    #[test]
    fn test_huge_length_prefix_is_malformed() {
        let mut bytes = codec().encode(&sample()).unwrap();
        bytes[5..9].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(codec().decode(&bytes), Err(CodecError::Malformed(_))));
    }
}
