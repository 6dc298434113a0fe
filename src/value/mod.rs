//! Dynamic object model: tagged value graphs with structural hashing.
//!
//! A [`Value`] carries one of thirteen payload tags plus optional source
//! location metadata and an optional attached [`TypeInstance`] from the
//! typing layer. Ownership replaces the manual reference counting of
//! classic object models: `Clone` retains, `Drop` releases. Descriptor
//! values never close their descriptor on drop; shared memory handles
//! close theirs exactly once when the last clone goes away.

mod describe;
pub(crate) mod pack;
#[cfg(target_os = "linux")]
mod shmem;

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::mem::ManuallyDrop;
use std::os::fd::{BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::Error;
use crate::typing::TypeInstance;

pub use pack::{PackArg, Slot};
#[cfg(target_os = "linux")]
pub use shmem::{SharedMemory, ShmemMapping};

/// Payload tag and data of a [`Value`].
#[derive(Clone, Debug, Default)]
pub enum Kind {
    #[default]
    Null,
    Bool(bool),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    /// UTC instant at second resolution.
    Date(i64),
    /// Length-counted UTF-8 text. May contain interior NULs.
    String(String),
    Binary(Bytes),
    /// Borrowed kernel descriptor. Never closed on drop; duplication is
    /// an explicit operation.
    Fd(RawFd),
    #[cfg(target_os = "linux")]
    Shmem(SharedMemory),
    Error(Box<ErrorValue>),
    Array(Vec<Value>),
    Dictionary(HashMap<String, Value>),
}

/// Payload of an error value: code, message and two nested values.
#[derive(Clone, Debug)]
pub struct ErrorValue {
    pub code: i32,
    pub message: String,
    pub extra: Value,
    pub stack: Value,
}

/// A tagged, self-describing object.
#[derive(Clone, Debug, Default)]
pub struct Value {
    kind: Kind,
    typei: Option<TypeInstance>,
    location: Option<(u32, u32)>,
}

impl Value {
    pub fn null() -> Value {
        Value::default()
    }

    pub fn boolean(v: bool) -> Value {
        Kind::Bool(v).into()
    }

    pub fn int64(v: i64) -> Value {
        Kind::Int64(v).into()
    }

    pub fn uint64(v: u64) -> Value {
        Kind::Uint64(v).into()
    }

    pub fn double(v: f64) -> Value {
        Kind::Double(v).into()
    }

    /// Date from seconds since the Unix epoch, UTC.
    pub fn date(secs: i64) -> Value {
        Kind::Date(secs).into()
    }

    pub fn date_now() -> Value {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Value::date(secs)
    }

    pub fn string(v: impl Into<String>) -> Value {
        Kind::String(v.into()).into()
    }

    /// Binary blob. `Bytes` carries the owned-or-borrowed distinction:
    /// `Bytes::copy_from_slice` duplicates, `Bytes::from_static` borrows.
    pub fn binary(v: impl Into<Bytes>) -> Value {
        Kind::Binary(v.into()).into()
    }

    /// Wraps a raw descriptor without taking ownership of it.
    pub fn fd(fd: RawFd) -> Value {
        Kind::Fd(fd).into()
    }

    #[cfg(target_os = "linux")]
    pub fn shmem(mem: SharedMemory) -> Value {
        Kind::Shmem(mem).into()
    }

    pub fn error(code: i32, message: &str, extra: Value) -> Value {
        Kind::Error(Box::new(ErrorValue {
            code,
            message: message.to_string(),
            extra,
            stack: Value::null(),
        }))
        .into()
    }

    pub fn error_with_stack(code: i32, message: &str, extra: Value, stack: Value) -> Value {
        Kind::Error(Box::new(ErrorValue {
            code,
            message: message.to_string(),
            extra,
            stack,
        }))
        .into()
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Value {
        Kind::Array(items.into_iter().collect()).into()
    }

    pub fn dictionary() -> Value {
        Kind::Dictionary(HashMap::new()).into()
    }

    pub fn dictionary_from<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Kind::Dictionary(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
        .into()
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn into_kind(self) -> Kind {
        self.kind
    }

    /// Tag name used by descriptions, diagnostics and builtin validation.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            Kind::Null => "null",
            Kind::Bool(_) => "bool",
            Kind::Int64(_) => "int64",
            Kind::Uint64(_) => "uint64",
            Kind::Double(_) => "double",
            Kind::Date(_) => "date",
            Kind::String(_) => "string",
            Kind::Binary(_) => "binary",
            Kind::Fd(_) => "fd",
            #[cfg(target_os = "linux")]
            Kind::Shmem(_) => "shmem",
            Kind::Error(_) => "error",
            Kind::Array(_) => "array",
            Kind::Dictionary(_) => "dictionary",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, Kind::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            Kind::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.kind {
            Kind::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.kind {
            Kind::Uint64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            Kind::Double(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<i64> {
        match self.kind {
            Kind::Date(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            Kind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            Kind::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<RawFd> {
        match self.kind {
            Kind::Fd(fd) => Some(fd),
            _ => None,
        }
    }

    #[cfg(target_os = "linux")]
    pub fn as_shmem(&self) -> Option<&SharedMemory> {
        match &self.kind {
            Kind::Shmem(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match &self.kind {
            Kind::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<i32> {
        self.as_error().map(|e| e.code)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.as_error().map(|e| e.message.as_str())
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match &self.kind {
            Kind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&HashMap<String, Value>> {
        match &self.kind {
            Kind::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Duplicates the descriptor held by an fd value. The returned handle
    /// owns the new descriptor; the value keeps the original.
    pub fn fd_dup(&self) -> Result<OwnedFd, Error> {
        let fd = self
            .as_fd()
            .ok_or_else(|| Error::Invalid("not an fd value".into()))?;
        dup_raw(fd)
    }

    // -- array operations ---------------------------------------------------

    pub fn array_len(&self) -> usize {
        self.as_array().map(|a| a.len()).unwrap_or(0)
    }

    pub fn array_get(&self, index: usize) -> Option<&Value> {
        self.as_array().and_then(|a| a.get(index))
    }

    /// Sets `index`, auto-extending the array with nulls when the index
    /// lies past the current end.
    pub fn array_set(&mut self, index: usize, value: Value) {
        if let Kind::Array(items) = &mut self.kind {
            if index >= items.len() {
                items.resize_with(index + 1, Value::null);
            }
            items[index] = value;
        }
    }

    pub fn array_append(&mut self, value: Value) {
        if let Kind::Array(items) = &mut self.kind {
            items.push(value);
        }
    }

    pub fn array_remove(&mut self, index: usize) {
        if let Kind::Array(items) = &mut self.kind {
            if index < items.len() {
                items.remove(index);
            }
        }
    }

    /// Copy of `[start, start + len)`, clamped to the array bounds.
    /// `len == None` takes everything through the end.
    pub fn array_slice(&self, start: usize, len: Option<usize>) -> Value {
        let items = self.as_array().unwrap_or(&[]);
        let end = match len {
            Some(len) => (start + len).min(items.len()),
            None => items.len(),
        };
        Value::array(items[start.min(items.len())..end].iter().cloned())
    }

    pub fn array_contains(&self, value: &Value) -> bool {
        self.as_array()
            .map(|a| a.iter().any(|v| v == value))
            .unwrap_or(false)
    }

    // -- dictionary operations ----------------------------------------------

    pub fn dict_len(&self) -> usize {
        self.as_dict().map(|d| d.len()).unwrap_or(0)
    }

    pub fn dict_get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn dict_has_key(&self, key: &str) -> bool {
        self.dict_get(key).is_some()
    }

    pub fn dict_set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Kind::Dictionary(map) = &mut self.kind {
            map.insert(key.into(), value.into());
        }
    }

    pub fn dict_remove(&mut self, key: &str) {
        if let Kind::Dictionary(map) = &mut self.kind {
            map.remove(key);
        }
    }

    // -- metadata ------------------------------------------------------------

    /// Source location (line, column) recorded by a parser, if any.
    pub fn location(&self) -> Option<(u32, u32)> {
        self.location
    }

    pub fn set_location(&mut self, line: u32, column: u32) {
        self.location = Some((line, column));
    }

    pub fn type_instance(&self) -> Option<&TypeInstance> {
        self.typei.as_ref()
    }

    pub fn set_type_instance(&mut self, typei: TypeInstance) {
        self.typei = Some(typei);
    }

    pub fn with_type_instance(mut self, typei: TypeInstance) -> Value {
        self.typei = Some(typei);
        self
    }

    pub(crate) fn clear_type_instance(&mut self) {
        self.typei = None;
    }

    // -- copy, hash, equality ------------------------------------------------

    /// Deep copy. Containers copy element-wise; fd and shmem values
    /// duplicate their descriptor so the copy refers to the same open
    /// file through a fresh handle.
    pub fn deep_copy(&self) -> Result<Value, Error> {
        let kind = match &self.kind {
            Kind::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.deep_copy()?);
                }
                Kind::Array(out)
            }
            Kind::Dictionary(map) => {
                let mut out = HashMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.deep_copy()?);
                }
                Kind::Dictionary(out)
            }
            Kind::Error(e) => Kind::Error(Box::new(ErrorValue {
                code: e.code,
                message: e.message.clone(),
                extra: e.extra.deep_copy()?,
                stack: e.stack.deep_copy()?,
            })),
            Kind::Fd(fd) => Kind::Fd(dup_raw(*fd)?.into_raw_fd()),
            #[cfg(target_os = "linux")]
            Kind::Shmem(m) => Kind::Shmem(m.duplicate()?),
            other => other.clone(),
        };
        Ok(Value {
            kind,
            typei: self.typei.clone(),
            location: self.location,
        })
    }

    /// Deterministic structural hash.
    ///
    /// Array and dictionary hashes XOR-fold their entries and are
    /// therefore order-independent: `[1, 2]` and `[2, 1]` hash equal.
    /// Use [`PartialEq`] for strict comparison.
    pub fn hash(&self) -> u64 {
        match &self.kind {
            Kind::Null => 0,
            Kind::Bool(v) => *v as u64,
            Kind::Int64(v) => *v as u64,
            Kind::Uint64(v) => *v,
            Kind::Double(v) => *v as i64 as u64,
            Kind::Date(v) => *v as u64,
            Kind::String(s) => djb2(s.as_bytes()),
            Kind::Binary(b) => djb2(b),
            Kind::Fd(fd) => file_identity(*fd).map(|(dev, ino)| dev ^ ino).unwrap_or(0),
            #[cfg(target_os = "linux")]
            Kind::Shmem(m) => file_identity(m.raw_fd())
                .map(|(dev, ino)| dev ^ ino)
                .unwrap_or(0),
            Kind::Error(e) => e.code as u64 ^ djb2(e.message.as_bytes()) ^ e.extra.hash(),
            Kind::Dictionary(map) => map
                .iter()
                .fold(0, |acc, (k, v)| acc ^ (djb2(k.as_bytes()) ^ v.hash())),
            Kind::Array(items) => items.iter().fold(0, |acc, v| acc ^ v.hash()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Strict structural equality. Hash equality is implied but not
/// sufficient; this comparison walks the payload. Descriptor values
/// compare equal when they refer to the same open file.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (&self.kind, &other.kind) {
            (Kind::Null, Kind::Null) => true,
            (Kind::Bool(a), Kind::Bool(b)) => a == b,
            (Kind::Int64(a), Kind::Int64(b)) => a == b,
            (Kind::Uint64(a), Kind::Uint64(b)) => a == b,
            (Kind::Double(a), Kind::Double(b)) => a == b,
            (Kind::Date(a), Kind::Date(b)) => a == b,
            (Kind::String(a), Kind::String(b)) => a == b,
            (Kind::Binary(a), Kind::Binary(b)) => a == b,
            (Kind::Fd(a), Kind::Fd(b)) => match (file_identity(*a), file_identity(*b)) {
                (Some(ia), Some(ib)) => ia == ib,
                _ => a == b,
            },
            #[cfg(target_os = "linux")]
            (Kind::Shmem(a), Kind::Shmem(b)) => {
                match (file_identity(a.raw_fd()), file_identity(b.raw_fd())) {
                    (Some(ia), Some(ib)) => ia == ib,
                    _ => false,
                }
            }
            (Kind::Error(a), Kind::Error(b)) => {
                a.code == b.code && a.message == b.message && a.extra == b.extra
            }
            (Kind::Array(a), Kind::Array(b)) => a == b,
            (Kind::Dictionary(a), Kind::Dictionary(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map(|o| o == v).unwrap_or(false))
            }
            _ => false,
        }
    }
}

impl From<Kind> for Value {
    fn from(kind: Kind) -> Value {
        Value {
            kind,
            typei: None,
            location: None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::uint64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::string(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Value {
        Value::binary(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::array(v)
    }
}

/// djb2 over the byte sequence. Both endpoints of a connection must agree
/// on this function for cross-process hash comparisons to hold.
pub(crate) fn djb2(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(5381u64, |h, &b| h.wrapping_mul(33).wrapping_add(b as u64))
}

/// (device, inode) of the open file behind a descriptor. Two handles to
/// the same open file report the same identity.
pub(crate) fn file_identity(fd: RawFd) -> Option<(u64, u64)> {
    if fd < 0 {
        return None;
    }
    // Borrow the descriptor without adopting ownership.
    let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    file.metadata().ok().map(|m| (m.dev(), m.ino()))
}

pub(crate) fn dup_raw(fd: RawFd) -> Result<OwnedFd, Error> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    Ok(borrowed.try_clone_to_owned()?)
}

/// Closes a raw descriptor, ignoring errors.
///
/// Descriptors received over a connection belong to the receiver, and fd
/// values never close on drop: a handler that is done with a received
/// descriptor (usually after duplicating it) releases it through here.
pub fn close_raw(fd: RawFd) {
    if fd >= 0 {
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}
