use rmp_serde::{decode::Error as DecodeError, encode::Error as EncodeError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to convert submission to JSON value: {0}")]
    JsonSerialize(#[source] serde_json::Error),
    #[error("failed to encode canonical messagepack: {0}")]
    MessagePackEncode(#[source] EncodeError),
    #[error("failed to decode messagepack submission: {0}")]
    MessagePackDecode(#[source] DecodeError),
    #[error("decoded submission does not match target type: {0}")]
    JsonDeserialize(#[source] serde_json::Error),
}

// Going through `Value` fixes field order: `serde_json::Map` keeps its keys
// sorted, so equal values always encode to equal bytes.
pub fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_value(value).map_err(CodecError::JsonSerialize)?;
    rmp_serde::to_vec_named(&json).map_err(CodecError::MessagePackEncode)
}

pub fn decode_canonical<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let decoded: Value = rmp_serde::from_slice(bytes).map_err(CodecError::MessagePackDecode)?;
    serde_json::from_value(decoded).map_err(CodecError::JsonDeserialize)
}
