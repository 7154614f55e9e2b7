//! Params decoding with the positional-arguments compatibility shim.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::RpcError;

/// Decode call params into a handler's declared argument shape.
///
/// If direct decoding fails and the payload is not already an array, the
/// payload is re-wrapped as a one-element array and decoding is retried
/// once. Some clients send a bare value where a positional list is
/// expected; this shim is best-effort interoperability, not a guaranteed
/// contract. Decoding failure has no side effects.
pub fn decode<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let rewrap = if params.is_array() {
        None
    } else {
        Some(params.clone())
    };
    match serde_json::from_value::<T>(params) {
        Ok(args) => Ok(args),
        Err(direct) => {
            if let Some(value) = rewrap {
                if let Ok(args) = serde_json::from_value::<T>(Value::Array(vec![value])) {
                    return Ok(args);
                }
            }
            Err(RpcError::InvalidParams {
                message: format!("cannot decode params: {direct}"),
            })
        }
    }
}
