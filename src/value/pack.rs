//! Format-string driven value construction and destructuring.
//!
//! `pack` builds a value graph from a compact format string plus an
//! argument list; `unpack` walks an existing graph with the same token
//! vocabulary and binds leaves into caller-supplied slots. The argument
//! list stands in for the variadic argument stream of the classic C
//! formulation of this mini-language.
//!
//! Pack tokens: `n` null, `b` bool, `B` binary, `f` fd, `i` int64,
//! `u` uint64, `d` double, `s` string, `v` pre-built value, `[...]`
//! array, `{...}` dictionary, `<decl>` typed wrap (registry required).
//! Inside a container an entry may carry a `key:`/`index:` prefix; the
//! special prefix `s:` (and the absence of any prefix) pulls the
//! dictionary key from the argument stream, and array indices
//! auto-increment from zero.
//!
//! Unpack tokens mirror pack: `v b i u d f s` bind, `*` skips, `[`/`{`
//! descend, `R` captures the remaining array tail.

use std::collections::VecDeque;
use std::os::fd::RawFd;

use bytes::Bytes;

use crate::error::Error;
use crate::typing::Registry;

use super::Value;

/// One argument consumed by [`Value::pack`].
#[derive(Debug)]
pub enum PackArg {
    Value(Value),
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    Bytes(Bytes),
    Fd(RawFd),
}

impl From<Value> for PackArg {
    fn from(v: Value) -> PackArg {
        PackArg::Value(v)
    }
}

impl From<bool> for PackArg {
    fn from(v: bool) -> PackArg {
        PackArg::Bool(v)
    }
}

impl From<i64> for PackArg {
    fn from(v: i64) -> PackArg {
        PackArg::Int(v)
    }
}

impl From<u64> for PackArg {
    fn from(v: u64) -> PackArg {
        PackArg::Uint(v)
    }
}

impl From<f64> for PackArg {
    fn from(v: f64) -> PackArg {
        PackArg::Double(v)
    }
}

impl From<&str> for PackArg {
    fn from(v: &str) -> PackArg {
        PackArg::Str(v.to_string())
    }
}

impl From<String> for PackArg {
    fn from(v: String) -> PackArg {
        PackArg::Str(v)
    }
}

impl From<Bytes> for PackArg {
    fn from(v: Bytes) -> PackArg {
        PackArg::Bytes(v)
    }
}

/// One binding target consumed by [`Value::unpack`].
pub enum Slot<'a> {
    /// Dictionary key taken from the slot stream.
    Key(&'a str),
    Value(&'a mut Value),
    Bool(&'a mut bool),
    Int(&'a mut i64),
    Uint(&'a mut u64),
    Double(&'a mut f64),
    Str(&'a mut String),
    Fd(&'a mut RawFd),
    /// Receives the array tail captured by `R`.
    Rest(&'a mut Value),
}

impl Value {
    /// Builds a value from a format string and an argument list.
    ///
    /// Fails with a shape error on a malformed format, an exhausted or
    /// mismatched argument list, or a `<decl>` wrap (typed packing goes
    /// through [`Registry::pack`]).
    pub fn pack<I>(fmt: &str, args: I) -> Result<Value, Error>
    where
        I: IntoIterator,
        I::Item: Into<PackArg>,
    {
        pack_with(None, fmt, args.into_iter().map(Into::into).collect())
    }

    /// Destructures this value according to `fmt`, binding leaves into
    /// `slots` in stream order. Returns the number of bindings made; any
    /// shape mismatch fails without partial guarantees about `slots`.
    pub fn unpack(&self, fmt: &str, slots: &mut [Slot<'_>]) -> Result<usize, Error> {
        let mut unpacker = Unpacker {
            fmt: fmt.as_bytes(),
            pos: 0,
            slots: slots.iter_mut(),
            count: 0,
        };
        unpacker.element(self)?;
        Ok(unpacker.count)
    }
}

pub(crate) fn pack_with(
    registry: Option<&Registry>,
    fmt: &str,
    args: Vec<PackArg>,
) -> Result<Value, Error> {
    let mut packer = Packer {
        fmt: fmt.as_bytes(),
        pos: 0,
        args: args.into(),
        registry,
    };
    if packer.fmt.is_empty() {
        return Err(Error::Invalid("empty pack format".into()));
    }
    packer.element()
}

struct Packer<'a> {
    fmt: &'a [u8],
    pos: usize,
    args: VecDeque<PackArg>,
    registry: Option<&'a Registry>,
}

impl<'a> Packer<'a> {
    fn peek(&self) -> Option<u8> {
        self.fmt.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8, Error> {
        let ch = self
            .peek()
            .ok_or_else(|| Error::Invalid("truncated pack format".into()))?;
        self.pos += 1;
        Ok(ch)
    }

    fn next_arg(&mut self) -> Result<PackArg, Error> {
        self.args
            .pop_front()
            .ok_or_else(|| Error::Invalid("pack argument list exhausted".into()))
    }

    fn element(&mut self) -> Result<Value, Error> {
        if self.peek() == Some(b'<') {
            let decl = self.typed_decl()?;
            let registry = self.registry.ok_or_else(|| {
                Error::Invalid("typed pack token requires a registry".into())
            })?;
            let typei = registry.new_typei(&decl)?;
            let value = self.element()?;
            return Ok(value.with_type_instance(typei));
        }

        match self.bump()? {
            b'n' => Ok(Value::null()),
            b'b' => match self.next_arg()? {
                PackArg::Bool(v) => Ok(Value::boolean(v)),
                other => Err(arg_mismatch("b", &other)),
            },
            b'i' => match self.next_arg()? {
                PackArg::Int(v) => Ok(Value::int64(v)),
                other => Err(arg_mismatch("i", &other)),
            },
            b'u' => match self.next_arg()? {
                PackArg::Uint(v) => Ok(Value::uint64(v)),
                other => Err(arg_mismatch("u", &other)),
            },
            b'd' => match self.next_arg()? {
                PackArg::Double(v) => Ok(Value::double(v)),
                other => Err(arg_mismatch("d", &other)),
            },
            b's' => match self.next_arg()? {
                PackArg::Str(v) => Ok(Value::string(v)),
                other => Err(arg_mismatch("s", &other)),
            },
            b'B' => match self.next_arg()? {
                PackArg::Bytes(v) => Ok(Value::binary(v)),
                other => Err(arg_mismatch("B", &other)),
            },
            b'f' => match self.next_arg()? {
                PackArg::Fd(v) => Ok(Value::fd(v)),
                other => Err(arg_mismatch("f", &other)),
            },
            b'v' => match self.next_arg()? {
                PackArg::Value(v) => Ok(v),
                other => Err(arg_mismatch("v", &other)),
            },
            b'[' => self.array(),
            b'{' => self.dictionary(),
            ch => Err(Error::Invalid(format!(
                "unexpected pack token '{}'",
                ch as char
            ))),
        }
    }

    fn array(&mut self) -> Result<Value, Error> {
        let mut array = Value::array([]);
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(array);
        }
        loop {
            let index = match self.prefix()? {
                Some(text) => text.parse::<usize>().map_err(|_| {
                    Error::Invalid(format!("bad array index prefix '{}'", text))
                })?,
                None => array.array_len(),
            };
            let value = self.element()?;
            array.array_set(index, value);

            match self.bump()? {
                b',' => continue,
                b']' => return Ok(array),
                ch => {
                    return Err(Error::Invalid(format!(
                        "expected ',' or ']' in pack format, got '{}'",
                        ch as char
                    )))
                }
            }
        }
    }

    fn dictionary(&mut self) -> Result<Value, Error> {
        let mut dict = Value::dictionary();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(dict);
        }
        loop {
            let key = match self.prefix()? {
                // `s:` pulls the key from the argument stream, as does the
                // absence of any prefix; anything else is a literal key.
                Some(text) if text == "s" => self.key_arg()?,
                Some(text) => text,
                None => self.key_arg()?,
            };
            let value = self.element()?;
            dict.dict_set(key, value);

            match self.bump()? {
                b',' => continue,
                b'}' => return Ok(dict),
                ch => {
                    return Err(Error::Invalid(format!(
                        "expected ',' or '}}' in pack format, got '{}'",
                        ch as char
                    )))
                }
            }
        }
    }

    fn key_arg(&mut self) -> Result<String, Error> {
        match self.next_arg()? {
            PackArg::Str(key) => Ok(key),
            other => Err(arg_mismatch("dictionary key", &other)),
        }
    }

    /// Consumes a `prefix:` ahead of the next element, if one is present.
    fn prefix(&mut self) -> Result<Option<String>, Error> {
        let mut cursor = self.pos;
        while let Some(&ch) = self.fmt.get(cursor) {
            match ch {
                b':' => {
                    let text = std::str::from_utf8(&self.fmt[self.pos..cursor])
                        .map_err(|_| Error::Invalid("non-UTF-8 pack format".into()))?
                        .to_string();
                    self.pos = cursor + 1;
                    return Ok(Some(text));
                }
                b',' | b'<' | b'[' | b']' | b'{' | b'}' => return Ok(None),
                _ => cursor += 1,
            }
        }
        Ok(None)
    }

    /// Consumes `<decl>` honouring nested angle brackets.
    fn typed_decl(&mut self) -> Result<String, Error> {
        self.pos += 1; // opening '<'
        let start = self.pos;
        let mut nesting = 1usize;
        while let Some(&ch) = self.fmt.get(self.pos) {
            match ch {
                b'<' => nesting += 1,
                b'>' => {
                    nesting -= 1;
                    if nesting == 0 {
                        let decl = std::str::from_utf8(&self.fmt[start..self.pos])
                            .map_err(|_| Error::Invalid("non-UTF-8 pack format".into()))?
                            .to_string();
                        self.pos += 1;
                        return Ok(decl);
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(Error::Invalid("unterminated type declaration".into()))
    }
}

fn arg_mismatch(token: &str, got: &PackArg) -> Error {
    let name = match got {
        PackArg::Value(_) => "value",
        PackArg::Bool(_) => "bool",
        PackArg::Int(_) => "int64",
        PackArg::Uint(_) => "uint64",
        PackArg::Double(_) => "double",
        PackArg::Str(_) => "string",
        PackArg::Bytes(_) => "binary",
        PackArg::Fd(_) => "fd",
    };
    Error::Invalid(format!(
        "pack token '{}' does not accept a {} argument",
        token, name
    ))
}

struct Unpacker<'s, 'a> {
    fmt: &'s [u8],
    pos: usize,
    slots: std::slice::IterMut<'s, Slot<'a>>,
    count: usize,
}

impl<'s, 'a> Unpacker<'s, 'a> {
    fn peek(&self) -> Option<u8> {
        self.fmt.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8, Error> {
        let ch = self
            .peek()
            .ok_or_else(|| Error::Invalid("truncated unpack format".into()))?;
        self.pos += 1;
        Ok(ch)
    }

    fn next_slot(&mut self) -> Result<&'s mut Slot<'a>, Error> {
        self.slots
            .next()
            .ok_or_else(|| Error::Invalid("unpack slot list exhausted".into()))
    }

    fn element(&mut self, current: &Value) -> Result<(), Error> {
        match self.bump()? {
            b'*' => Ok(()),
            b'v' => match self.next_slot()? {
                Slot::Value(out) => {
                    **out = current.clone();
                    self.count += 1;
                    Ok(())
                }
                _ => Err(slot_mismatch("v")),
            },
            b'b' => {
                let v = current
                    .as_bool()
                    .ok_or_else(|| shape_mismatch("bool", current))?;
                match self.next_slot()? {
                    Slot::Bool(out) => {
                        **out = v;
                        self.count += 1;
                        Ok(())
                    }
                    _ => Err(slot_mismatch("b")),
                }
            }
            b'i' => {
                let v = current
                    .as_i64()
                    .ok_or_else(|| shape_mismatch("int64", current))?;
                match self.next_slot()? {
                    Slot::Int(out) => {
                        **out = v;
                        self.count += 1;
                        Ok(())
                    }
                    _ => Err(slot_mismatch("i")),
                }
            }
            b'u' => {
                let v = current
                    .as_u64()
                    .ok_or_else(|| shape_mismatch("uint64", current))?;
                match self.next_slot()? {
                    Slot::Uint(out) => {
                        **out = v;
                        self.count += 1;
                        Ok(())
                    }
                    _ => Err(slot_mismatch("u")),
                }
            }
            b'd' => {
                let v = current
                    .as_f64()
                    .ok_or_else(|| shape_mismatch("double", current))?;
                match self.next_slot()? {
                    Slot::Double(out) => {
                        **out = v;
                        self.count += 1;
                        Ok(())
                    }
                    _ => Err(slot_mismatch("d")),
                }
            }
            b's' => {
                let v = current
                    .as_str()
                    .ok_or_else(|| shape_mismatch("string", current))?;
                match self.next_slot()? {
                    Slot::Str(out) => {
                        **out = v.to_string();
                        self.count += 1;
                        Ok(())
                    }
                    _ => Err(slot_mismatch("s")),
                }
            }
            b'f' => {
                let v = current
                    .as_fd()
                    .ok_or_else(|| shape_mismatch("fd", current))?;
                match self.next_slot()? {
                    Slot::Fd(out) => {
                        **out = v;
                        self.count += 1;
                        Ok(())
                    }
                    _ => Err(slot_mismatch("f")),
                }
            }
            b'[' => self.array(current),
            b'{' => self.dictionary(current),
            ch => Err(Error::Invalid(format!(
                "unexpected unpack token '{}'",
                ch as char
            ))),
        }
    }

    fn array(&mut self, current: &Value) -> Result<(), Error> {
        let items = current
            .as_array()
            .ok_or_else(|| shape_mismatch("array", current))?;
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(());
        }

        let mut index = 0usize;
        loop {
            if self.peek() == Some(b'R') {
                self.pos += 1;
                let tail = Value::array(items.iter().skip(index).cloned());
                match self.next_slot()? {
                    Slot::Rest(out) => {
                        **out = tail;
                        self.count += 1;
                    }
                    _ => return Err(slot_mismatch("R")),
                }
                index = items.len();
            } else {
                if let Some(text) = self.prefix()? {
                    index = text.parse::<usize>().map_err(|_| {
                        Error::Invalid(format!("bad array index prefix '{}'", text))
                    })?;
                }
                let item = items
                    .get(index)
                    .ok_or_else(|| Error::Invalid(format!("array index {} out of bounds", index)))?;
                self.element(item)?;
                index += 1;
            }

            match self.bump()? {
                b',' => continue,
                b']' => return Ok(()),
                ch => {
                    return Err(Error::Invalid(format!(
                        "expected ',' or ']' in unpack format, got '{}'",
                        ch as char
                    )))
                }
            }
        }
    }

    fn dictionary(&mut self, current: &Value) -> Result<(), Error> {
        if current.as_dict().is_none() {
            return Err(shape_mismatch("dictionary", current));
        }
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(());
        }

        loop {
            let key = match self.prefix()? {
                Some(text) if text == "s" => self.key_slot()?,
                Some(text) => text,
                None => self.key_slot()?,
            };
            let item = current
                .dict_get(&key)
                .ok_or_else(|| Error::Invalid(format!("missing dictionary key '{}'", key)))?;
            self.element(item)?;

            match self.bump()? {
                b',' => continue,
                b'}' => return Ok(()),
                ch => {
                    return Err(Error::Invalid(format!(
                        "expected ',' or '}}' in unpack format, got '{}'",
                        ch as char
                    )))
                }
            }
        }
    }

    fn key_slot(&mut self) -> Result<String, Error> {
        match self.next_slot()? {
            Slot::Key(key) => Ok(key.to_string()),
            _ => Err(Error::Invalid(
                "dictionary descent requires a key slot".into(),
            )),
        }
    }

    fn prefix(&mut self) -> Result<Option<String>, Error> {
        let mut cursor = self.pos;
        while let Some(&ch) = self.fmt.get(cursor) {
            match ch {
                b':' => {
                    let text = std::str::from_utf8(&self.fmt[self.pos..cursor])
                        .map_err(|_| Error::Invalid("non-UTF-8 unpack format".into()))?
                        .to_string();
                    self.pos = cursor + 1;
                    return Ok(Some(text));
                }
                b',' | b'[' | b']' | b'{' | b'}' => return Ok(None),
                _ => cursor += 1,
            }
        }
        Ok(None)
    }
}

fn slot_mismatch(token: &str) -> Error {
    Error::Invalid(format!("unpack token '{}' bound to a mismatched slot", token))
}

fn shape_mismatch(expected: &str, got: &Value) -> Error {
    Error::Invalid(format!(
        "shape mismatch: expected {}, got {}",
        expected,
        got.kind_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_scalars() {
        let v = Value::pack("i", [PackArg::Int(42)]).unwrap();
        assert_eq!(v.as_i64(), Some(42));

        let v = Value::pack("n", Vec::<PackArg>::new()).unwrap();
        assert!(v.is_null());

        let v = Value::pack("s", [PackArg::from("hello")]).unwrap();
        assert_eq!(v.as_str(), Some("hello"));
    }

    #[test]
    fn test_pack_dict_with_stream_keys() {
        let v = Value::pack(
            "{s:i,s:[i,i,i]}",
            vec![
                "n".into(),
                PackArg::Int(3),
                "xs".into(),
                PackArg::Int(1),
                PackArg::Int(2),
                PackArg::Int(3),
            ],
        )
        .unwrap();

        assert_eq!(v.dict_get("n").unwrap().as_i64(), Some(3));
        let xs = v.dict_get("xs").unwrap();
        assert_eq!(xs.array_len(), 3);
        assert_eq!(xs.array_get(2).unwrap().as_i64(), Some(3));
    }

    #[test]
    fn test_pack_literal_keys() {
        let v = Value::pack(
            "{count:i,name:s}",
            vec![PackArg::Int(7), "x".into()],
        )
        .unwrap();
        assert_eq!(v.dict_get("count").unwrap().as_i64(), Some(7));
        assert_eq!(v.dict_get("name").unwrap().as_str(), Some("x"));
    }

    #[test]
    fn test_pack_array_index_prefix() {
        let v = Value::pack("[2:i]", [PackArg::Int(9)]).unwrap();
        assert_eq!(v.array_len(), 3);
        assert!(v.array_get(0).unwrap().is_null());
        assert_eq!(v.array_get(2).unwrap().as_i64(), Some(9));
    }

    #[test]
    fn test_pack_nested_containers() {
        let v = Value::pack(
            "{s:{s:[b,n]}}",
            vec![
                "outer".into(),
                "inner".into(),
                PackArg::Bool(true),
            ],
        )
        .unwrap();
        let inner = v.dict_get("outer").unwrap().dict_get("inner").unwrap();
        assert_eq!(inner.array_len(), 2);
        assert_eq!(inner.array_get(0).unwrap().as_bool(), Some(true));
        assert!(inner.array_get(1).unwrap().is_null());
    }

    #[test]
    fn test_pack_embedded_value() {
        let pre = Value::array([Value::int64(1)]);
        let v = Value::pack("{s:v}", vec![PackArg::from("a"), pre.clone().into()]).unwrap();
        assert_eq!(v.dict_get("a").unwrap(), &pre);
    }

    #[test]
    fn test_pack_empty_containers() {
        assert_eq!(Value::pack("[]", Vec::<PackArg>::new()).unwrap().array_len(), 0);
        assert_eq!(Value::pack("{}", Vec::<PackArg>::new()).unwrap().dict_len(), 0);
    }

    #[test]
    fn test_pack_malformed_format() {
        assert!(Value::pack("q", Vec::<PackArg>::new()).is_err());
        assert!(Value::pack("[i", [PackArg::Int(1)]).is_err());
        assert!(Value::pack("{s:i", vec!["k".into(), PackArg::Int(1)]).is_err());
        assert!(Value::pack("", Vec::<PackArg>::new()).is_err());
    }

    #[test]
    fn test_pack_argument_mismatch() {
        assert!(Value::pack("i", [PackArg::from("nope")]).is_err());
        assert!(Value::pack("i", Vec::<PackArg>::new()).is_err());
    }

    #[test]
    fn test_pack_typed_without_registry() {
        assert!(Value::pack("<geom.Point>v", [PackArg::Value(Value::null())]).is_err());
    }

    #[test]
    fn test_unpack_round_trip() {
        let v = Value::pack(
            "{s:i,s:[i,i,i]}",
            vec![
                "n".into(),
                PackArg::Int(3),
                "xs".into(),
                PackArg::Int(1),
                PackArg::Int(2),
                PackArg::Int(3),
            ],
        )
        .unwrap();

        let (mut n, mut a, mut b, mut c) = (0i64, 0i64, 0i64, 0i64);
        let count = v
            .unpack(
                "{s:i,s:[i,i,i]}",
                &mut [
                    Slot::Key("n"),
                    Slot::Int(&mut n),
                    Slot::Key("xs"),
                    Slot::Int(&mut a),
                    Slot::Int(&mut b),
                    Slot::Int(&mut c),
                ],
            )
            .unwrap();

        assert_eq!(count, 4);
        assert_eq!((n, a, b, c), (3, 1, 2, 3));
    }

    #[test]
    fn test_unpack_skip_and_rest() {
        let v = Value::array((0..5).map(Value::int64));
        let mut rest = Value::null();
        let mut first = 0i64;
        let count = v
            .unpack("[i,*,R]", &mut [Slot::Int(&mut first), Slot::Rest(&mut rest)])
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(first, 0);
        assert_eq!(rest.array_len(), 3);
        assert_eq!(rest.array_get(0).unwrap().as_i64(), Some(2));
    }

    #[test]
    fn test_unpack_shape_mismatch() {
        let v = Value::int64(1);
        let mut out = false;
        assert!(v.unpack("b", &mut [Slot::Bool(&mut out)]).is_err());

        let v = Value::array([Value::int64(1)]);
        let mut a = 0i64;
        let mut b = 0i64;
        assert!(v
            .unpack("[i,i]", &mut [Slot::Int(&mut a), Slot::Int(&mut b)])
            .is_err());
    }

    #[test]
    fn test_unpack_missing_key() {
        let v = Value::dictionary_from([("a", Value::int64(1))]);
        let mut out = 0i64;
        assert!(v
            .unpack("{s:i}", &mut [Slot::Key("b"), Slot::Int(&mut out)])
            .is_err());
    }

    #[test]
    fn test_unpack_value_binding() {
        let v = Value::dictionary_from([("a", Value::array([Value::int64(1)]))]);
        let mut out = Value::null();
        let count = v
            .unpack("{s:v}", &mut [Slot::Key("a"), Slot::Value(&mut out)])
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(out.array_len(), 1);
    }
}
