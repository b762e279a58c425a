// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A reader/writer for the subset of CPython's `marshal` format needed
//! to walk a code object graph: enough to recognize and rewrite nested
//! code objects and list-from-tuple constant patterns, not a
//! general-purpose marshal implementation. An object whose type tag
//! falls outside the subset below surfaces as `Error::ContainerIO`
//! rather than being silently misread.

use crate::error::Error;

/// Type tags, mirroring `Python/marshal.c`. The high bit (`FLAG_REF`)
/// marks a value that must be recorded in the back-reference table so a
/// later `TYPE_REF` can point at it; this is how marshal avoids
/// duplicating interned strings and shared constants.
mod tag {
    pub const NULL: u8 = b'0';
    pub const NONE: u8 = b'N';
    pub const FALSE: u8 = b'F';
    pub const TRUE: u8 = b'T';
    pub const INT: u8 = b'i';
    pub const SHORT_ASCII: u8 = b'z';
    pub const SHORT_ASCII_INTERNED: u8 = b'Z';
    pub const UNICODE: u8 = b'u';
    pub const STRING: u8 = b's';
    pub const SMALL_TUPLE: u8 = b')';
    pub const TUPLE: u8 = b'(';
    pub const CODE: u8 = b'c';
    pub const REF: u8 = b'r';
    pub const FLAG_REF: u8 = 0x80;
}

/// A constants-pool value. `Code` boxes a `RawCodeObject` rather than
/// the working `inst::CodeObject` form: constants are read/written by
/// this module before the walker has decoded anything into the
/// instruction model.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    /// `TYPE_STRING`: a raw byte string, distinct from `Str` (unicode).
    /// Kept as bytes rather than lossy-decoded since `bytes` constants
    /// appear in real `co_consts` pools and must round-trip exactly.
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    Code(Box<RawCodeObject>),
    /// A `TYPE_REF` the reader could not resolve inline. In practice
    /// every ref marshal ever emits points at an already-read value, so
    /// `Reader::value` resolves it immediately and this variant is only
    /// reachable if a stream references an index not yet in the table;
    /// kept so that case surfaces as data rather than a read error.
    Ref(usize),
}

/// A code object exactly as read off disk: `co_code` still an opaque
/// byte string, `co_lnotab` still the compact on-disk form. `walk`
/// decodes one of these into an `inst::CodeObject` before editing it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCodeObject {
    pub argcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
    pub filename: String,
    pub name: String,
    pub first_line_no: u32,
    pub lnotab: Vec<u8>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    refs: Vec<Value>,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0, refs: Vec::new() }
    }

    fn byte(&mut self) -> Result<u8, Error> {
        let b = *self.buf.get(self.pos).ok_or_else(|| Error::ContainerIO("unexpected end of marshal stream".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or_else(|| Error::ContainerIO("marshal length overflow".into()))?;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| Error::ContainerIO("unexpected end of marshal stream".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn u32_le(&mut self) -> Result<u32, Error> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32_le(&mut self) -> Result<i32, Error> {
        Ok(self.u32_le()? as i32)
    }

    fn value(&mut self) -> Result<Value, Error> {
        let raw = self.byte()?;
        let is_ref = raw & tag::FLAG_REF != 0;
        let t = raw & !tag::FLAG_REF;
        let value = match t {
            tag::NULL => Value::None,
            tag::NONE => Value::None,
            tag::FALSE => Value::Bool(false),
            tag::TRUE => Value::Bool(true),
            tag::INT => Value::Int(self.i32_le()? as i64),
            tag::SHORT_ASCII | tag::SHORT_ASCII_INTERNED => {
                let len = self.byte()? as usize;
                let bytes = self.bytes(len)?;
                Value::Str(String::from_utf8_lossy(bytes).into_owned())
            }
            tag::UNICODE => {
                let len = self.u32_le()? as usize;
                let bytes = self.bytes(len)?;
                Value::Str(String::from_utf8_lossy(bytes).into_owned())
            }
            tag::STRING => {
                let len = self.u32_le()? as usize;
                let bytes = self.bytes(len)?;
                Value::Bytes(bytes.to_vec())
            }
            tag::SMALL_TUPLE => {
                let n = self.byte()? as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.value()?);
                }
                Value::Tuple(items)
            }
            tag::TUPLE => {
                let n = self.u32_le()? as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.value()?);
                }
                Value::Tuple(items)
            }
            tag::CODE => Value::Code(Box::new(self.code_object()?)),
            tag::REF => {
                let idx = self.u32_le()? as usize;
                self.refs.get(idx).cloned().unwrap_or(Value::Ref(idx))
            }
            other => {
                return Err(Error::ContainerIO(format!(
                    "unsupported marshal type tag {other:#x} ({:?})",
                    other as char
                )))
            }
        };
        if is_ref {
            self.refs.push(value.clone());
        }
        Ok(value)
    }

    fn string(&mut self) -> Result<String, Error> {
        match self.value()? {
            Value::Str(s) => Ok(s),
            Value::None => Ok(String::new()),
            other => Err(Error::ContainerIO(format!("expected string in marshal stream, found {other:?}"))),
        }
    }

    fn tuple_of_strings(&mut self) -> Result<Vec<String>, Error> {
        match self.value()? {
            Value::Tuple(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s),
                    other => Err(Error::ContainerIO(format!("expected string in name tuple, found {other:?}"))),
                })
                .collect(),
            other => Err(Error::ContainerIO(format!("expected tuple in marshal stream, found {other:?}"))),
        }
    }

    fn code_object(&mut self) -> Result<RawCodeObject, Error> {
        let argcount = self.u32_le()?;
        let kwonlyargcount = self.u32_le()?;
        let nlocals = self.u32_le()?;
        let stacksize = self.u32_le()?;
        let flags = self.u32_le()?;
        let code = match self.value()? {
            Value::Bytes(b) => b,
            Value::Str(s) => s.into_bytes(),
            other => return Err(Error::ContainerIO(format!("expected bytes for co_code, found {other:?}"))),
        };
        let consts = match self.value()? {
            Value::Tuple(items) => items,
            other => return Err(Error::ContainerIO(format!("expected tuple for co_consts, found {other:?}"))),
        };
        let names = self.tuple_of_strings()?;
        let varnames = self.tuple_of_strings()?;
        let freevars = self.tuple_of_strings()?;
        let cellvars = self.tuple_of_strings()?;
        let filename = self.string()?;
        let name = self.string()?;
        let first_line_no = self.u32_le()?;
        let lnotab = match self.value()? {
            Value::Bytes(b) => b,
            Value::Str(s) => s.into_bytes(),
            other => return Err(Error::ContainerIO(format!("expected bytes for co_lnotab, found {other:?}"))),
        };
        Ok(RawCodeObject {
            argcount,
            kwonlyargcount,
            nlocals,
            stacksize,
            flags,
            code,
            consts,
            names,
            varnames,
            freevars,
            cellvars,
            filename,
            name,
            first_line_no,
            lnotab,
        })
    }
}

/// Reads one marshalled value (expected to be a code object at the
/// module root) from `buf`.
pub fn read_code_object(buf: &[u8]) -> Result<RawCodeObject, Error> {
    let mut reader = Reader::new(buf);
    reader.code_object()
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn new() -> Writer {
        Writer { out: Vec::new() }
    }

    fn u32_le(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn value(&mut self, v: &Value) {
        match v {
            Value::None => self.out.push(tag::NONE),
            Value::Bool(true) => self.out.push(tag::TRUE),
            Value::Bool(false) => self.out.push(tag::FALSE),
            Value::Int(n) => {
                self.out.push(tag::INT);
                self.u32_le(*n as i32 as u32);
            }
            Value::Str(s) => {
                self.out.push(tag::UNICODE);
                self.u32_le(s.len() as u32);
                self.out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                self.out.push(tag::STRING);
                self.u32_le(b.len() as u32);
                self.out.extend_from_slice(b);
            }
            Value::Ref(idx) => {
                self.out.push(tag::REF);
                self.u32_le(*idx as u32);
            }
            Value::Tuple(items) => {
                self.out.push(tag::TUPLE);
                self.u32_le(items.len() as u32);
                for item in items {
                    self.value(item);
                }
            }
            Value::Code(code) => {
                self.out.push(tag::CODE);
                self.code_object(code);
            }
        }
    }

    fn bytes_value(&mut self, bytes: &[u8]) {
        self.out.push(tag::STRING);
        self.u32_le(bytes.len() as u32);
        self.out.extend_from_slice(bytes);
    }

    fn name_tuple(&mut self, names: &[String]) {
        self.out.push(tag::TUPLE);
        self.u32_le(names.len() as u32);
        for n in names {
            self.value(&Value::Str(n.clone()));
        }
    }

    fn code_object(&mut self, code: &RawCodeObject) {
        self.u32_le(code.argcount);
        self.u32_le(code.kwonlyargcount);
        self.u32_le(code.nlocals);
        self.u32_le(code.stacksize);
        self.u32_le(code.flags);
        self.bytes_value(&code.code);
        self.out.push(tag::TUPLE);
        self.u32_le(code.consts.len() as u32);
        for c in &code.consts {
            self.value(c);
        }
        self.name_tuple(&code.names);
        self.name_tuple(&code.varnames);
        self.name_tuple(&code.freevars);
        self.name_tuple(&code.cellvars);
        self.value(&Value::Str(code.filename.clone()));
        self.value(&Value::Str(code.name.clone()));
        self.u32_le(code.first_line_no);
        self.bytes_value(&code.lnotab);
    }
}

/// Serializes a code object back into marshal bytes, mirroring
/// `write_code_object`'s field order exactly so the two stay a matched
/// pair.
pub fn write_code_object(code: &RawCodeObject) -> Vec<u8> {
    let mut w = Writer::new();
    w.out.push(tag::CODE);
    w.code_object(code);
    w.out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_code(name: &str) -> RawCodeObject {
        RawCodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 2,
            flags: 0,
            code: vec![0x64, 0x00, 0x53, 0x00],
            consts: vec![Value::None],
            names: vec![],
            varnames: vec![],
            freevars: vec![],
            cellvars: vec![],
            filename: "<test>".to_string(),
            name: name.to_string(),
            first_line_no: 1,
            lnotab: vec![],
        }
    }

    #[test]
    fn test_code_object_round_trip() {
        let code = sample_code("f");
        let bytes = write_code_object(&code);
        let back = read_code_object(&bytes).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn test_nested_code_round_trip() {
        let inner = sample_code("inner");
        let outer = RawCodeObject { consts: vec![Value::Code(Box::new(inner.clone()))], ..sample_code("outer") };
        let bytes = write_code_object(&outer);
        let back = read_code_object(&bytes).unwrap();
        match &back.consts[0] {
            Value::Code(c) => assert_eq!(c.name, inner.name),
            other => panic!("expected nested code, found {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_tag_is_an_error() {
        let err = read_code_object(&[b'f']).unwrap_err();
        assert!(matches!(err, Error::ContainerIO(_)));
    }
}
