//! JSON frame codec.
//!
//! Encodes a value graph into a frame payload plus the descriptor array
//! that rides as ancillary data next to it. Payload constructs that JSON
//! cannot express natively use reserved single-key objects:
//!
//! | construct | encoding |
//! |-----------|----------|
//! | uint64    | `{"$uint": n}` |
//! | date      | `{"$date": seconds}` |
//! | binary    | `{"$bin": base64}` |
//! | fd        | `{"$fd": index}` into the ancillary descriptor array |
//! | shmem     | `{"$shmem": {"fd": index, "offset": o, "size": s}}` |
//! | error     | `{"$err": {...}}` |
//! | non-finite double | `{"$dbl": "nan" \| "inf" \| "-inf"}` |
//!
//! A user dictionary that would collide with the reserved shape (exactly
//! one key starting with `$`) is wrapped as `{"$dict": {...}}`.

use std::os::fd::{IntoRawFd, OwnedFd};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Map, Number, Value as Json};

use crate::error::Error;
use crate::value::{Kind, Value};

#[cfg(target_os = "linux")]
use crate::value::SharedMemory;

/// Encodes a value graph into payload bytes plus the descriptors it
/// references. Descriptor-carrying values are duplicated, so the input
/// graph keeps its own handles; the returned descriptors are owned and
/// close on drop once the frame has been sent.
pub fn encode(value: &Value) -> Result<(Bytes, Vec<OwnedFd>), Error> {
    let mut fds = Vec::new();
    let json = encode_value(value, &mut fds)?;
    let bytes = serde_json::to_vec(&json).map_err(|e| Error::Protocol(e.to_string()))?;
    Ok((Bytes::from(bytes), fds))
}

fn encode_value(value: &Value, fds: &mut Vec<OwnedFd>) -> Result<Json, Error> {
    Ok(match value.kind() {
        Kind::Null => Json::Null,
        Kind::Bool(v) => Json::Bool(*v),
        Kind::Int64(v) => Json::Number(Number::from(*v)),
        Kind::Uint64(v) => json!({ "$uint": v }),
        Kind::Double(v) => match Number::from_f64(*v) {
            Some(n) => Json::Number(n),
            None => {
                let name = if v.is_nan() {
                    "nan"
                } else if *v > 0.0 {
                    "inf"
                } else {
                    "-inf"
                };
                json!({ "$dbl": name })
            }
        },
        Kind::Date(secs) => json!({ "$date": secs }),
        Kind::String(s) => Json::String(s.clone()),
        Kind::Binary(bytes) => json!({ "$bin": BASE64.encode(bytes) }),
        Kind::Fd(_) => {
            let dup = value.fd_dup()?;
            let index = fds.len();
            fds.push(dup);
            json!({ "$fd": index })
        }
        #[cfg(target_os = "linux")]
        Kind::Shmem(mem) => {
            let index = fds.len();
            fds.push(crate::value::dup_raw(mem.raw_fd())?);
            json!({ "$shmem": { "fd": index, "offset": mem.offset(), "size": mem.size() } })
        }
        Kind::Error(e) => json!({ "$err": {
            "code": e.code,
            "message": e.message,
            "extra": encode_value(&e.extra, fds)?,
            "stack": encode_value(&e.stack, fds)?,
        }}),
        Kind::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_value(item, fds)?);
            }
            Json::Array(out)
        }
        Kind::Dictionary(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), encode_value(v, fds)?);
            }
            // Shield a user dictionary that happens to look like one of
            // the reserved single-key objects.
            if out.len() == 1 && out.keys().next().map_or(false, |k| k.starts_with('$')) {
                json!({ "$dict": Json::Object(out) })
            } else {
                Json::Object(out)
            }
        }
    })
}

/// Decodes a frame payload, resolving `$fd` references against the
/// received descriptor array. Descriptors resolved into the graph are
/// released to the receiver (values never close them); unreferenced or
/// partially decoded descriptors are closed here.
pub fn decode(payload: &[u8], fds: Vec<OwnedFd>) -> Result<Value, Error> {
    let json: Json =
        serde_json::from_slice(payload).map_err(|e| Error::Protocol(e.to_string()))?;
    let mut slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
    decode_value(&json, &mut slots)
}

fn decode_value(json: &Json, fds: &mut Vec<Option<OwnedFd>>) -> Result<Value, Error> {
    Ok(match json {
        Json::Null => Value::null(),
        Json::Bool(v) => Value::boolean(*v),
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                Value::int64(v)
            } else if let Some(v) = n.as_u64() {
                Value::uint64(v)
            } else if let Some(v) = n.as_f64() {
                Value::double(v)
            } else {
                return Err(Error::Protocol(format!("unrepresentable number {}", n)));
            }
        }
        Json::String(s) => Value::string(s.clone()),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_value(item, fds)?);
            }
            Value::array(out)
        }
        Json::Object(map) => {
            if map.len() == 1 {
                if let Some((key, body)) = map.iter().next() {
                    if key.starts_with('$') {
                        return decode_extension(key, body, fds);
                    }
                }
            }
            let mut out = Value::dictionary();
            for (k, v) in map {
                out.dict_set(k.clone(), decode_value(v, fds)?);
            }
            out
        }
    })
}

fn decode_extension(
    key: &str,
    body: &Json,
    fds: &mut Vec<Option<OwnedFd>>,
) -> Result<Value, Error> {
    match key {
        "$uint" => body
            .as_u64()
            .map(Value::uint64)
            .ok_or_else(|| Error::Protocol("$uint payload must be an unsigned integer".into())),
        "$date" => body
            .as_i64()
            .map(Value::date)
            .ok_or_else(|| Error::Protocol("$date payload must be an integer".into())),
        "$dbl" => match body.as_str() {
            Some("nan") => Ok(Value::double(f64::NAN)),
            Some("inf") => Ok(Value::double(f64::INFINITY)),
            Some("-inf") => Ok(Value::double(f64::NEG_INFINITY)),
            _ => Err(Error::Protocol("bad $dbl payload".into())),
        },
        "$bin" => {
            let text = body
                .as_str()
                .ok_or_else(|| Error::Protocol("$bin payload must be a string".into()))?;
            let bytes = BASE64
                .decode(text)
                .map_err(|e| Error::Protocol(format!("bad base64 payload: {}", e)))?;
            Ok(Value::binary(Bytes::from(bytes)))
        }
        "$fd" => {
            let index = body
                .as_u64()
                .ok_or_else(|| Error::Protocol("$fd payload must be an index".into()))?;
            let fd = take_fd(fds, index as usize)?;
            Ok(Value::fd(fd.into_raw_fd()))
        }
        #[cfg(target_os = "linux")]
        "$shmem" => {
            let index = body
                .get("fd")
                .and_then(Json::as_u64)
                .ok_or_else(|| Error::Protocol("$shmem payload needs an fd index".into()))?;
            let offset = body.get("offset").and_then(Json::as_i64).unwrap_or(0);
            let size = body
                .get("size")
                .and_then(Json::as_u64)
                .ok_or_else(|| Error::Protocol("$shmem payload needs a size".into()))?;
            let fd = take_fd(fds, index as usize)?;
            Ok(Value::shmem(SharedMemory::from_parts(
                fd,
                offset,
                size as usize,
            )))
        }
        "$err" => {
            let code = body
                .get("code")
                .and_then(Json::as_i64)
                .ok_or_else(|| Error::Protocol("$err payload needs a code".into()))?;
            let message = body.get("message").and_then(Json::as_str).unwrap_or("");
            let extra = match body.get("extra") {
                Some(extra) => decode_value(extra, fds)?,
                None => Value::null(),
            };
            let stack = match body.get("stack") {
                Some(stack) => decode_value(stack, fds)?,
                None => Value::null(),
            };
            Ok(Value::error_with_stack(code as i32, message, extra, stack))
        }
        "$dict" => {
            let map = body
                .as_object()
                .ok_or_else(|| Error::Protocol("$dict payload must be an object".into()))?;
            let mut out = Value::dictionary();
            for (k, v) in map {
                out.dict_set(k.clone(), decode_value(v, fds)?);
            }
            Ok(out)
        }
        other => Err(Error::Protocol(format!("unknown extension key '{}'", other))),
    }
}

fn take_fd(fds: &mut Vec<Option<OwnedFd>>, index: usize) -> Result<OwnedFd, Error> {
    fds.get_mut(index)
        .and_then(Option::take)
        .ok_or_else(|| Error::Protocol(format!("descriptor index {} out of range", index)))
}
