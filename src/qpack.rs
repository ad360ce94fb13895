//! Thin adapter around the payload value codec.
//!
//! The wire payload is a tagged value tree; this module selects encode or
//! decode per message type and enforces the two limits SiriDB puts on a
//! package: integers must fit in signed 63 bits and the encoded payload
//! must stay under [`MAX_PACKAGE_SZ`].

use rmpv::Value;

use crate::constant::{DType, MAX_PACKAGE_SZ, RequestType};
use crate::error::{Error, Result};

/// Produce the payload bytes for a request.
pub(crate) fn pack_request(ty: RequestType, data: Option<&Value>) -> Result<Vec<u8>> {
    match ty.dtype() {
        DType::None => Ok(Vec::new()),
        DType::Encoded => {
            let nil = Value::Nil;
            let value = data.unwrap_or(&nil);
            encode(value)
        }
        DType::Raw => Ok(match data {
            Some(Value::Binary(bytes)) => bytes.clone(),
            _ => Vec::new(),
        }),
    }
}

/// Encode a value tree, rejecting out-of-range integers and oversized
/// payloads before anything is written to the transport.
pub(crate) fn encode(value: &Value) -> Result<Vec<u8>> {
    check_int_range(value)?;
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)?;
    if buf.len() > MAX_PACKAGE_SZ {
        return Err(Error::OverflowError(format!(
            "package size too large (got {} bytes, max allowed: {} bytes)",
            buf.len(),
            MAX_PACKAGE_SZ
        )));
    }
    Ok(buf)
}

pub(crate) fn decode(mut bytes: &[u8]) -> Result<Value> {
    Ok(rmpv::decode::read_value(&mut bytes)?)
}

/// Pull `error_msg` out of an error response payload.
pub(crate) fn error_msg(payload: &[u8]) -> Option<String> {
    let Ok(Value::Map(entries)) = decode(payload) else {
        return None;
    };
    entries.into_iter().find_map(|(key, value)| {
        (key.as_str() == Some("error_msg"))
            .then(|| value.as_str().map(ToString::to_string))
            .flatten()
    })
}

/// Integer values should be signed and not more than 63 bits.
fn check_int_range(value: &Value) -> Result<()> {
    match value {
        Value::Integer(n) if n.as_i64().is_none() => Err(Error::OverflowError(format!(
            "integer value {:?} does not fit in a signed 64-bit word",
            n
        ))),
        Value::Array(items) => items.iter().try_for_each(check_int_range),
        Value::Map(entries) => entries.iter().try_for_each(|(key, value)| {
            check_int_range(key)?;
            check_int_range(value)
        }),
        _ => Ok(()),
    }
}
