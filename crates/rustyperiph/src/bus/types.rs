//! Common types for bus messages
//!
//! This module defines object paths, type signatures and the dynamically
//! typed [`Value`] carried in message bodies.

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Maximum length of a type signature
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum nesting of containers inside a single type
const MAX_TYPE_DEPTH: usize = 64;

/// A validated object path, e.g. `/org/bluez/hci0`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validates and wraps an object path
    pub fn new(path: impl Into<String>) -> Result<Self, ProtocolError> {
        let path = path.into();
        if Self::is_valid(&path) {
            Ok(ObjectPath(path))
        } else {
            Err(ProtocolError::InvalidObjectPath(path))
        }
    }

    /// The root path `/`
    pub fn root() -> Self {
        ObjectPath("/".to_string())
    }

    fn is_valid(path: &str) -> bool {
        if path == "/" {
            return true;
        }
        if !path.starts_with('/') || path.ends_with('/') {
            return false;
        }
        path[1..].split('/').all(|element| {
            !element.is_empty()
                && element
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends a single path element
    pub fn child(&self, element: &str) -> Result<Self, ProtocolError> {
        if element.is_empty() || element.contains('/') {
            return Err(ProtocolError::InvalidObjectPath(format!("{}/{}", self.0, element)));
        }
        if self.0 == "/" {
            ObjectPath::new(format!("/{}", element))
        } else {
            ObjectPath::new(format!("{}/{}", self.0, element))
        }
    }

    /// Whether `self` lies strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &ObjectPath) -> bool {
        if ancestor.0 == "/" {
            return self.0 != "/";
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectPath {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectPath::new(s)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single complete type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Str,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Parses a signature into its sequence of complete types
    pub fn parse_signature(signature: &str) -> Result<Vec<Type>, ProtocolError> {
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(ProtocolError::InvalidSignature(signature.to_string()));
        }
        let bytes = signature.as_bytes();
        let mut pos = 0;
        let mut types = Vec::new();
        while pos < bytes.len() {
            types.push(Self::parse_one(signature, bytes, &mut pos, 0)?);
        }
        Ok(types)
    }

    /// Parses a signature that must contain exactly one complete type
    pub fn parse_single(signature: &str) -> Result<Type, ProtocolError> {
        let mut types = Self::parse_signature(signature)?;
        if types.len() != 1 {
            return Err(ProtocolError::InvalidSignature(signature.to_string()));
        }
        Ok(types.remove(0))
    }

    fn parse_one(
        signature: &str,
        bytes: &[u8],
        pos: &mut usize,
        depth: usize,
    ) -> Result<Type, ProtocolError> {
        let invalid = || ProtocolError::InvalidSignature(signature.to_string());
        if depth > MAX_TYPE_DEPTH {
            return Err(invalid());
        }
        let code = *bytes.get(*pos).ok_or_else(invalid)?;
        *pos += 1;
        let ty = match code {
            b'y' => Type::Byte,
            b'b' => Type::Bool,
            b'n' => Type::Int16,
            b'q' => Type::UInt16,
            b'i' => Type::Int32,
            b'u' => Type::UInt32,
            b'x' => Type::Int64,
            b't' => Type::UInt64,
            b'd' => Type::Double,
            b's' => Type::Str,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'v' => Type::Variant,
            b'a' => {
                if bytes.get(*pos) == Some(&b'{') {
                    *pos += 1;
                    let key = Self::parse_one(signature, bytes, pos, depth + 1)?;
                    if !key.is_basic() {
                        return Err(invalid());
                    }
                    let value = Self::parse_one(signature, bytes, pos, depth + 1)?;
                    if bytes.get(*pos) != Some(&b'}') {
                        return Err(invalid());
                    }
                    *pos += 1;
                    Type::Array(Box::new(Type::DictEntry(Box::new(key), Box::new(value))))
                } else {
                    Type::Array(Box::new(Self::parse_one(signature, bytes, pos, depth + 1)?))
                }
            }
            b'(' => {
                let mut fields = Vec::new();
                loop {
                    match bytes.get(*pos) {
                        Some(b')') => {
                            *pos += 1;
                            break;
                        }
                        Some(_) => fields.push(Self::parse_one(signature, bytes, pos, depth + 1)?),
                        None => return Err(invalid()),
                    }
                }
                if fields.is_empty() {
                    return Err(invalid());
                }
                Type::Struct(fields)
            }
            _ => return Err(invalid()),
        };
        Ok(ty)
    }

    /// Whether this is a basic (non-container) type usable as a dict key
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Struct(_) | Type::DictEntry(_, _)
        )
    }

    /// Wire alignment of this type in bytes
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::UInt16 => 2,
            Type::Bool | Type::Int32 | Type::UInt32 | Type::Str | Type::ObjectPath | Type::Array(_) => 4,
            Type::Int64 | Type::UInt64 | Type::Double | Type::Struct(_) | Type::DictEntry(_, _) => 8,
        }
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Type::Byte => out.push('y'),
            Type::Bool => out.push('b'),
            Type::Int16 => out.push('n'),
            Type::UInt16 => out.push('q'),
            Type::Int32 => out.push('i'),
            Type::UInt32 => out.push('u'),
            Type::Int64 => out.push('x'),
            Type::UInt64 => out.push('t'),
            Type::Double => out.push('d'),
            Type::Str => out.push('s'),
            Type::ObjectPath => out.push('o'),
            Type::Signature => out.push('g'),
            Type::Variant => out.push('v'),
            Type::Array(elem) => {
                out.push('a');
                elem.write_signature(out);
            }
            Type::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Type::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_signature(&mut out);
        f.write_str(&out)
    }
}

/// A dynamically typed value in a message body
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(String),
    Variant(Box<Value>),
    /// Array with its element type (kept so empty arrays still have a signature)
    Array(Type, Vec<Value>),
    /// Array of dict entries with key and value types
    Dict(Type, Type, Vec<(Value, Value)>),
    Struct(Vec<Value>),
}

impl Value {
    /// The complete type of this value
    pub fn value_type(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Bool(_) => Type::Bool,
            Value::Int16(_) => Type::Int16,
            Value::UInt16(_) => Type::UInt16,
            Value::Int32(_) => Type::Int32,
            Value::UInt32(_) => Type::UInt32,
            Value::Int64(_) => Type::Int64,
            Value::UInt64(_) => Type::UInt64,
            Value::Double(_) => Type::Double,
            Value::Str(_) => Type::Str,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::Variant(_) => Type::Variant,
            Value::Array(elem, _) => Type::Array(Box::new(elem.clone())),
            Value::Dict(key, value, _) => Type::Array(Box::new(Type::DictEntry(
                Box::new(key.clone()),
                Box::new(value.clone()),
            ))),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::value_type).collect()),
        }
    }

    /// Signature string of this value's type
    pub fn signature(&self) -> String {
        self.value_type().to_string()
    }

    /// Wraps a value in a variant
    pub fn variant(value: impl Into<Value>) -> Value {
        Value::Variant(Box::new(value.into()))
    }

    /// A byte array (`ay`)
    pub fn bytes(data: &[u8]) -> Value {
        Value::Array(Type::Byte, data.iter().copied().map(Value::Byte).collect())
    }

    /// A string array (`as`)
    pub fn str_array<I, S>(items: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array(
            Type::Str,
            items.into_iter().map(|s| Value::Str(s.into())).collect(),
        )
    }

    /// An object path array (`ao`)
    pub fn path_array<I>(items: I) -> Value
    where
        I: IntoIterator<Item = ObjectPath>,
    {
        Value::Array(Type::ObjectPath, items.into_iter().map(Value::ObjectPath).collect())
    }

    /// A property map (`a{sv}`); values are wrapped in variants
    pub fn property_map<I>(entries: I) -> Value
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Value::Dict(
            Type::Str,
            Type::Variant,
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k), Value::Variant(Box::new(v))))
                .collect(),
        )
    }

    /// Strips any number of variant wrappers
    pub fn flatten(&self) -> &Value {
        let mut value = self;
        while let Value::Variant(inner) = value {
            value = inner;
        }
        value
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.flatten() {
            Value::Str(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.flatten() {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self.flatten() {
            Value::Byte(b) => Some(*b),
            _ => None,
        }
    }

    /// Any unsigned or non-negative integer that fits in `u16`
    pub fn as_u16(&self) -> Option<u16> {
        self.as_u64().and_then(|v| u16::try_from(v).ok())
    }

    /// Any unsigned or non-negative integer that fits in `u32`
    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.flatten() {
            Value::Byte(v) => Some(u64::from(*v)),
            Value::UInt16(v) => Some(u64::from(*v)),
            Value::UInt32(v) => Some(u64::from(*v)),
            Value::UInt64(v) => Some(*v),
            Value::Int16(v) => u64::try_from(*v).ok(),
            Value::Int32(v) => u64::try_from(*v).ok(),
            Value::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self.flatten() {
            Value::Int16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object_path(&self) -> Option<&ObjectPath> {
        match self.flatten() {
            Value::ObjectPath(p) => Some(p),
            _ => None,
        }
    }

    /// Contents of a byte array
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self.flatten() {
            Value::Array(Type::Byte, items) => items.iter().map(Value::as_u8).collect(),
            _ => None,
        }
    }

    /// Contents of a string array
    pub fn as_str_array(&self) -> Option<Vec<String>> {
        match self.flatten() {
            Value::Array(_, items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self.flatten() {
            Value::Array(_, items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self.flatten() {
            Value::Dict(_, _, entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a string key in a dict, unwrapping variant values
    pub fn dict_get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v.flatten())
    }

    /// Converts an `a{sv}` dict into owned name/value pairs
    pub fn to_property_list(&self) -> Option<Vec<(String, Value)>> {
        self.as_dict()?
            .iter()
            .map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.flatten().clone())))
            .collect()
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::ObjectPath(v)
    }
}

impl From<&ObjectPath> for Value {
    fn from(v: &ObjectPath) -> Self {
        Value::ObjectPath(v.clone())
    }
}
