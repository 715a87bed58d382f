//! Bus message framing
//!
//! A message is a fixed 12-byte preamble, an array of header fields, padding
//! to an 8-byte boundary and the body.

use super::codec::{Decoder, Encoder};
use super::constants::*;
use super::types::{ObjectPath, Type, Value};
use crate::error::{MethodError, ProtocolError};
use bitflags::bitflags;

/// Size of the fixed preamble plus the header field array length
const FIXED_HEADER_LEN: usize = 16;

/// Maximum total message size
pub const MAX_MESSAGE_LEN: usize = 128 * 1024 * 1024;

/// Kind of message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

bitflags! {
    /// Header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 0x01;
        const NO_AUTO_START = 0x02;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 0x04;
    }
}

/// A decoded or outgoing bus message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: MessageFlags,
    /// Assigned by the connection when sent; zero until then
    pub serial: u32,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub body: Vec<Value>,
}

impl Message {
    fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: MessageFlags::empty(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            body: Vec::new(),
        }
    }

    /// Creates a method call
    pub fn method_call(
        destination: Option<&str>,
        path: &ObjectPath,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Self {
        let mut msg = Self::empty(MessageType::MethodCall);
        msg.destination = destination.map(str::to_string);
        msg.path = Some(path.clone());
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        msg.body = body;
        msg
    }

    /// Creates a successful reply to `call`
    pub fn method_return(call: &Message, body: Vec<Value>) -> Self {
        let mut msg = Self::empty(MessageType::MethodReturn);
        msg.flags = MessageFlags::NO_REPLY_EXPECTED;
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg.body = body;
        msg
    }

    /// Creates an error reply to `call`
    pub fn error(call: &Message, error: &MethodError) -> Self {
        let mut msg = Self::empty(MessageType::Error);
        msg.flags = MessageFlags::NO_REPLY_EXPECTED;
        msg.reply_serial = Some(call.serial);
        msg.destination = call.sender.clone();
        msg.error_name = Some(error.name.clone());
        msg.body = vec![Value::Str(error.message.clone())];
        msg
    }

    /// Creates a broadcast signal
    pub fn signal(path: &ObjectPath, interface: &str, member: &str, body: Vec<Value>) -> Self {
        let mut msg = Self::empty(MessageType::Signal);
        msg.flags = MessageFlags::NO_REPLY_EXPECTED;
        msg.path = Some(path.clone());
        msg.interface = Some(interface.to_string());
        msg.member = Some(member.to_string());
        msg.body = body;
        msg
    }

    /// Whether the sender waits for a reply
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(MessageFlags::NO_REPLY_EXPECTED)
    }

    /// Signature of the body
    pub fn signature(&self) -> String {
        self.body.iter().map(Value::signature).collect()
    }

    pub fn member(&self) -> &str {
        self.member.as_deref().unwrap_or("")
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or("")
    }

    /// Converts an error reply into a [`MethodError`]
    pub fn to_method_error(&self) -> MethodError {
        let name = self
            .error_name
            .clone()
            .unwrap_or_else(|| DBUS_ERROR_FAILED.to_string());
        let message = self
            .body
            .first()
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        MethodError { name, message }
    }

    /// Checks the body signature against `expected`
    pub fn check_signature(&self, expected: &str) -> Result<(), ProtocolError> {
        let actual = self.signature();
        if actual == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedSignature {
                expected: expected.to_string(),
                actual,
            })
        }
    }

    /// Serializes the message; `serial` must already be assigned
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.serial == 0 {
            return Err(ProtocolError::InvalidMessage("serial not assigned".into()));
        }

        let mut body = Encoder::new();
        for value in &self.body {
            body.write_value(value)?;
        }
        let body = body.into_bytes();

        let mut fields = Vec::new();
        let mut field = |code: u8, value: Value| {
            fields.push(Value::Struct(vec![Value::Byte(code), Value::variant(value)]));
        };
        if let Some(path) = &self.path {
            field(HEADER_FIELD_PATH, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            field(HEADER_FIELD_INTERFACE, Value::Str(interface.clone()));
        }
        if let Some(member) = &self.member {
            field(HEADER_FIELD_MEMBER, Value::Str(member.clone()));
        }
        if let Some(error_name) = &self.error_name {
            field(HEADER_FIELD_ERROR_NAME, Value::Str(error_name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            field(HEADER_FIELD_REPLY_SERIAL, Value::UInt32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            field(HEADER_FIELD_DESTINATION, Value::Str(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            field(HEADER_FIELD_SENDER, Value::Str(sender.clone()));
        }
        if !self.body.is_empty() {
            field(HEADER_FIELD_SIGNATURE, Value::Signature(self.signature()));
        }

        let mut header = Encoder::new();
        header.write_u8(LITTLE_ENDIAN);
        header.write_u8(self.message_type.code());
        header.write_u8(self.flags.bits());
        header.write_u8(PROTOCOL_VERSION);
        header.write_u32(body.len() as u32);
        header.write_u32(self.serial);
        header.write_value(&Value::Array(header_field_type(), fields))?;
        header.align(8);
        header.write_raw(&body);

        let bytes = header.into_bytes();
        if bytes.len() > MAX_MESSAGE_LEN {
            return Err(ProtocolError::MessageTooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Length of the first complete message in `bytes`, if the header is available
    pub fn frame_length(bytes: &[u8]) -> Result<Option<usize>, ProtocolError> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }
        if bytes[0] != LITTLE_ENDIAN {
            return Err(ProtocolError::ByteOrder(bytes[0]));
        }
        let body_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let fields_len = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        let header_len = (FIXED_HEADER_LEN + fields_len + 7) & !7;
        let total = header_len + body_len;
        if total > MAX_MESSAGE_LEN {
            return Err(ProtocolError::MessageTooLarge(total));
        }
        Ok(Some(total))
    }

    /// Parses one complete message
    pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
        let total = Self::frame_length(bytes)?.ok_or(ProtocolError::Truncated)?;
        if bytes.len() < total {
            return Err(ProtocolError::Truncated);
        }
        let message_type = MessageType::from_code(bytes[1]).ok_or_else(|| {
            ProtocolError::InvalidMessage(format!("unknown message type {}", bytes[1]))
        })?;
        if bytes[3] != PROTOCOL_VERSION {
            return Err(ProtocolError::Version(bytes[3]));
        }
        let body_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let serial = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if serial == 0 {
            return Err(ProtocolError::InvalidMessage("zero serial".into()));
        }

        let mut msg = Self::empty(message_type);
        msg.flags = MessageFlags::from_bits_truncate(bytes[2]);
        msg.serial = serial;

        let mut decoder = Decoder::at(&bytes[..total], 12);
        let fields = decoder.read_value(&Type::Array(Box::new(header_field_type())))?;
        decoder.align(8)?;
        let body_start = decoder.position();
        if body_start + body_len != total {
            return Err(ProtocolError::InvalidMessage("body length mismatch".into()));
        }

        let mut signature = String::new();
        for field in fields.as_array().unwrap_or(&[]) {
            let (code, value) = match field {
                Value::Struct(parts) if parts.len() == 2 => match (&parts[0], parts[1].flatten()) {
                    (Value::Byte(code), value) => (*code, value),
                    _ => continue,
                },
                _ => continue,
            };
            match code {
                HEADER_FIELD_PATH => msg.path = value.as_object_path().cloned(),
                HEADER_FIELD_INTERFACE => msg.interface = value.as_str().map(str::to_string),
                HEADER_FIELD_MEMBER => msg.member = value.as_str().map(str::to_string),
                HEADER_FIELD_ERROR_NAME => msg.error_name = value.as_str().map(str::to_string),
                HEADER_FIELD_REPLY_SERIAL => msg.reply_serial = value.as_u32(),
                HEADER_FIELD_DESTINATION => msg.destination = value.as_str().map(str::to_string),
                HEADER_FIELD_SENDER => msg.sender = value.as_str().map(str::to_string),
                HEADER_FIELD_SIGNATURE => {
                    signature = value.as_str().unwrap_or("").to_string();
                }
                // Unknown fields must be ignored
                _ => {}
            }
        }

        msg.validate_required_fields()?;

        let body_types = Type::parse_signature(&signature)?;
        let mut body = Decoder::new(&bytes[body_start..total]);
        for ty in &body_types {
            msg.body.push(body.read_value(ty)?);
        }
        if !body.is_empty() {
            return Err(ProtocolError::InvalidMessage("trailing bytes after body".into()));
        }
        Ok(msg)
    }

    fn validate_required_fields(&self) -> Result<(), ProtocolError> {
        match self.message_type {
            MessageType::MethodCall => {
                self.path.as_ref().ok_or(ProtocolError::MissingHeaderField("PATH"))?;
                self.member.as_ref().ok_or(ProtocolError::MissingHeaderField("MEMBER"))?;
            }
            MessageType::MethodReturn => {
                self.reply_serial
                    .ok_or(ProtocolError::MissingHeaderField("REPLY_SERIAL"))?;
            }
            MessageType::Error => {
                self.error_name
                    .as_ref()
                    .ok_or(ProtocolError::MissingHeaderField("ERROR_NAME"))?;
                self.reply_serial
                    .ok_or(ProtocolError::MissingHeaderField("REPLY_SERIAL"))?;
            }
            MessageType::Signal => {
                self.path.as_ref().ok_or(ProtocolError::MissingHeaderField("PATH"))?;
                self.interface
                    .as_ref()
                    .ok_or(ProtocolError::MissingHeaderField("INTERFACE"))?;
                self.member.as_ref().ok_or(ProtocolError::MissingHeaderField("MEMBER"))?;
            }
        }
        Ok(())
    }
}

/// `(yv)`
fn header_field_type() -> Type {
    Type::Struct(vec![Type::Byte, Type::Variant])
}
