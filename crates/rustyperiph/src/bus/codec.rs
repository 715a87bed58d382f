//! Wire marshalling of values
//!
//! Implements the little-endian D-Bus encoding. Alignment is computed from
//! the start of the buffer, so callers must start a new encoder/decoder at an
//! 8-byte boundary of the message (the header start or the body start).

use super::types::{ObjectPath, Type, Value};
use crate::error::ProtocolError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

/// Maximum length of a single array in bytes
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Maximum nesting of values (variants count as a level)
const MAX_VALUE_DEPTH: usize = 64;

/// Writes values into a growing buffer
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current write offset
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Pads with zero bytes up to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) {
        while self.buf.len() % alignment != 0 {
            self.buf.push(0);
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.align(4);
        // Writing into a Vec cannot fail
        let _ = self.buf.write_u32::<LittleEndian>(v);
    }

    /// Appends raw bytes without alignment
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Marshals a single value at the current offset
    pub fn write_value(&mut self, value: &Value) -> Result<(), ProtocolError> {
        self.write_value_at_depth(value, 0)
    }

    fn write_value_at_depth(&mut self, value: &Value, depth: usize) -> Result<(), ProtocolError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(ProtocolError::InvalidMessage("value nested too deeply".into()));
        }
        match value {
            Value::Byte(v) => self.buf.push(*v),
            Value::Bool(v) => self.write_u32(u32::from(*v)),
            Value::Int16(v) => {
                self.align(2);
                let _ = self.buf.write_i16::<LittleEndian>(*v);
            }
            Value::UInt16(v) => {
                self.align(2);
                let _ = self.buf.write_u16::<LittleEndian>(*v);
            }
            Value::Int32(v) => {
                self.align(4);
                let _ = self.buf.write_i32::<LittleEndian>(*v);
            }
            Value::UInt32(v) => self.write_u32(*v),
            Value::Int64(v) => {
                self.align(8);
                let _ = self.buf.write_i64::<LittleEndian>(*v);
            }
            Value::UInt64(v) => {
                self.align(8);
                let _ = self.buf.write_u64::<LittleEndian>(*v);
            }
            Value::Double(v) => {
                self.align(8);
                let _ = self.buf.write_f64::<LittleEndian>(*v);
            }
            Value::Str(s) => self.write_string(s),
            Value::ObjectPath(p) => self.write_string(p.as_str()),
            Value::Signature(s) => {
                Type::parse_signature(s)?;
                self.write_signature(s);
            }
            Value::Variant(inner) => {
                let signature = inner.signature();
                self.write_signature(&signature);
                self.write_value_at_depth(inner, depth + 1)?;
            }
            Value::Array(elem, items) => {
                self.write_array(elem.alignment(), |enc| {
                    for item in items {
                        if item.value_type() != *elem {
                            return Err(ProtocolError::UnexpectedSignature {
                                expected: elem.to_string(),
                                actual: item.signature(),
                            });
                        }
                        enc.write_value_at_depth(item, depth + 1)?;
                    }
                    Ok(())
                })?;
            }
            Value::Dict(key_type, value_type, entries) => {
                self.write_array(8, |enc| {
                    for (key, value) in entries {
                        if key.value_type() != *key_type || value.value_type() != *value_type {
                            return Err(ProtocolError::UnexpectedSignature {
                                expected: format!("{{{}{}}}", key_type, value_type),
                                actual: format!("{{{}{}}}", key.signature(), value.signature()),
                            });
                        }
                        enc.align(8);
                        enc.write_value_at_depth(key, depth + 1)?;
                        enc.write_value_at_depth(value, depth + 1)?;
                    }
                    Ok(())
                })?;
            }
            Value::Struct(fields) => {
                self.align(8);
                for field in fields {
                    self.write_value_at_depth(field, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn write_signature(&mut self, s: &str) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn write_array<F>(&mut self, elem_alignment: usize, body: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&mut Self) -> Result<(), ProtocolError>,
    {
        self.write_u32(0);
        let len_pos = self.buf.len() - 4;
        // Padding to the first element is not part of the array length
        self.align(elem_alignment);
        let start = self.buf.len();
        body(self)?;
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_LEN {
            return Err(ProtocolError::MessageTooLarge(len));
        }
        self.buf[len_pos..len_pos + 4].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }
}

/// Reads values out of a byte slice
pub struct Decoder<'a> {
    cursor: Cursor<&'a [u8]>,
}

fn truncated(_: std::io::Error) -> ProtocolError {
    ProtocolError::Truncated
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    /// Starts decoding at `position`; alignment stays relative to the slice start
    pub fn at(data: &'a [u8], position: usize) -> Self {
        let mut cursor = Cursor::new(data);
        cursor.set_position(position as u64);
        Self { cursor }
    }

    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Skips padding up to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) -> Result<(), ProtocolError> {
        let pad = (alignment - self.position() % alignment) % alignment;
        if pad > self.remaining() {
            return Err(ProtocolError::Truncated);
        }
        self.cursor.set_position((self.position() + pad) as u64);
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.align(4)?;
        self.cursor.read_u32::<LittleEndian>().map_err(truncated)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        if len > self.remaining() {
            return Err(ProtocolError::Truncated);
        }
        let mut bytes = vec![0u8; len];
        self.cursor.read_exact(&mut bytes).map_err(truncated)?;
        Ok(bytes)
    }

    fn read_nul(&mut self) -> Result<(), ProtocolError> {
        match self.cursor.read_u8().map_err(truncated)? {
            0 => Ok(()),
            _ => Err(ProtocolError::InvalidString),
        }
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        self.read_nul()?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)
    }

    fn read_signature(&mut self) -> Result<String, ProtocolError> {
        let len = self.cursor.read_u8().map_err(truncated)? as usize;
        let bytes = self.read_bytes(len)?;
        self.read_nul()?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)
    }

    /// Unmarshals a value of the given type at the current offset
    pub fn read_value(&mut self, ty: &Type) -> Result<Value, ProtocolError> {
        self.read_value_at_depth(ty, 0)
    }

    fn read_value_at_depth(&mut self, ty: &Type, depth: usize) -> Result<Value, ProtocolError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(ProtocolError::InvalidMessage("value nested too deeply".into()));
        }
        let value = match ty {
            Type::Byte => Value::Byte(self.cursor.read_u8().map_err(truncated)?),
            Type::Bool => match self.read_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "invalid boolean value {}",
                        other
                    )))
                }
            },
            Type::Int16 => {
                self.align(2)?;
                Value::Int16(self.cursor.read_i16::<LittleEndian>().map_err(truncated)?)
            }
            Type::UInt16 => {
                self.align(2)?;
                Value::UInt16(self.cursor.read_u16::<LittleEndian>().map_err(truncated)?)
            }
            Type::Int32 => {
                self.align(4)?;
                Value::Int32(self.cursor.read_i32::<LittleEndian>().map_err(truncated)?)
            }
            Type::UInt32 => Value::UInt32(self.read_u32()?),
            Type::Int64 => {
                self.align(8)?;
                Value::Int64(self.cursor.read_i64::<LittleEndian>().map_err(truncated)?)
            }
            Type::UInt64 => {
                self.align(8)?;
                Value::UInt64(self.cursor.read_u64::<LittleEndian>().map_err(truncated)?)
            }
            Type::Double => {
                self.align(8)?;
                Value::Double(self.cursor.read_f64::<LittleEndian>().map_err(truncated)?)
            }
            Type::Str => Value::Str(self.read_string()?),
            Type::ObjectPath => Value::ObjectPath(ObjectPath::new(self.read_string()?)?),
            Type::Signature => {
                let signature = self.read_signature()?;
                Type::parse_signature(&signature)?;
                Value::Signature(signature)
            }
            Type::Variant => {
                let signature = self.read_signature()?;
                let inner = Type::parse_single(&signature)?;
                Value::Variant(Box::new(self.read_value_at_depth(&inner, depth + 1)?))
            }
            Type::Array(elem) => {
                let len = self.read_u32()? as usize;
                if len > MAX_ARRAY_LEN {
                    return Err(ProtocolError::MessageTooLarge(len));
                }
                self.align(elem.alignment())?;
                let end = self.position() + len;
                if end > self.cursor.get_ref().len() {
                    return Err(ProtocolError::Truncated);
                }
                let array = match elem.as_ref() {
                    Type::DictEntry(key_type, value_type) => {
                        let mut entries = Vec::new();
                        while self.position() < end {
                            self.align(8)?;
                            let key = self.read_value_at_depth(key_type, depth + 1)?;
                            let value = self.read_value_at_depth(value_type, depth + 1)?;
                            entries.push((key, value));
                        }
                        Value::Dict((**key_type).clone(), (**value_type).clone(), entries)
                    }
                    elem_type => {
                        let mut items = Vec::new();
                        while self.position() < end {
                            items.push(self.read_value_at_depth(elem_type, depth + 1)?);
                        }
                        Value::Array(elem_type.clone(), items)
                    }
                };
                if self.position() != end {
                    return Err(ProtocolError::InvalidMessage(
                        "array contents overrun declared length".into(),
                    ));
                }
                array
            }
            Type::Struct(fields) => {
                self.align(8)?;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.read_value_at_depth(field, depth + 1)?);
                }
                Value::Struct(values)
            }
            Type::DictEntry(_, _) => {
                return Err(ProtocolError::InvalidSignature(ty.to_string()));
            }
        };
        Ok(value)
    }
}
