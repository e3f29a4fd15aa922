//! The byte-level contract payloads satisfy to cross the backend boundary.
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SerializationContractViolation;

/// Data that can be stored behind a [`Handle`](crate::Handle).
///
/// Values are moved between versions and across execution contexts as CBOR
/// bytes, so any serde-serializable type that owns its data qualifies.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

pub(crate) fn encode<T: Payload>(value: &T) -> Result<Vec<u8>, SerializationContractViolation> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).map_err(|err| {
        SerializationContractViolation::Encode {
            type_name: std::any::type_name::<T>(),
            message: err.to_string(),
        }
    })?;
    Ok(buffer)
}

pub(crate) fn decode<T: Payload>(bytes: &[u8]) -> Result<T, SerializationContractViolation> {
    ciborium::from_reader(bytes).map_err(|err| SerializationContractViolation::Decode {
        type_name: std::any::type_name::<T>(),
        message: err.to_string(),
    })
}
