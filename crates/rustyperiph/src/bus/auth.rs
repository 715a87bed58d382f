//! Bus addresses and the SASL handshake

use super::constants::*;
use crate::error::ConnectionError;
use log::debug;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

/// Longest handshake line accepted from the server
const MAX_AUTH_LINE: usize = 16 * 1024;

/// A parsed bus transport address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAddress {
    /// `unix:path=...`
    UnixPath(PathBuf),
    /// `unix:abstract=...`
    UnixAbstract(String),
}

impl BusAddress {
    /// Parses the first usable entry of a `;`-separated address list
    pub fn parse(address: &str) -> Result<Self, ConnectionError> {
        for entry in address.split(';').filter(|e| !e.is_empty()) {
            let Some((transport, params)) = entry.split_once(':') else {
                continue;
            };
            if transport != "unix" {
                debug!("Skipping unsupported bus transport '{}'", transport);
                continue;
            }
            for param in params.split(',') {
                match param.split_once('=') {
                    Some(("path", value)) => {
                        return Ok(BusAddress::UnixPath(PathBuf::from(unescape(value)?)))
                    }
                    Some(("abstract", value)) => return Ok(BusAddress::UnixAbstract(unescape(value)?)),
                    _ => {}
                }
            }
        }
        Err(ConnectionError::Address(address.to_string()))
    }

    /// The system bus address from the environment, or the well-known default
    pub fn system() -> Result<Self, ConnectionError> {
        let address = std::env::var(SYSTEM_BUS_ADDRESS_ENV)
            .unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_string());
        Self::parse(&address)
    }

    /// Opens a stream to this address
    pub fn connect(&self) -> Result<UnixStream, ConnectionError> {
        match self {
            BusAddress::UnixPath(path) => Ok(UnixStream::connect(path)?),
            BusAddress::UnixAbstract(name) => connect_abstract(name),
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> Result<UnixStream, ConnectionError> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    Ok(UnixStream::connect_addr(&addr)?)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(name: &str) -> Result<UnixStream, ConnectionError> {
    Err(ConnectionError::Address(format!("unix:abstract={}", name)))
}

/// Decodes `%xx` escapes in an address value
fn unescape(value: &str) -> Result<String, ConnectionError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex_digits = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| ConnectionError::Address(value.to_string()))?;
            let decoded = hex::decode(hex_digits)
                .map_err(|_| ConnectionError::Address(value.to_string()))?;
            out.extend_from_slice(&decoded);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ConnectionError::Address(value.to_string()))
}

/// Runs the `EXTERNAL` handshake and returns the server GUID
pub fn authenticate(stream: &mut UnixStream) -> Result<String, ConnectionError> {
    // SAFETY: getuid has no preconditions and cannot fail
    let uid = unsafe { libc::getuid() };
    let command = format!("AUTH EXTERNAL {}\r\n", hex::encode(uid.to_string()));

    stream.write_all(b"\0")?;
    stream.write_all(command.as_bytes())?;

    let reply = read_line(stream)?;
    let guid = match reply.split_once(' ') {
        Some(("OK", guid)) => guid.trim().to_string(),
        _ if reply == "OK" => String::new(),
        _ => return Err(ConnectionError::Auth(reply)),
    };

    stream.write_all(b"BEGIN\r\n")?;
    debug!("Authenticated with bus server {}", guid);
    Ok(guid)
}

/// Reads one `\r\n`-terminated line byte by byte so nothing past it is consumed
fn read_line(stream: &mut UnixStream) -> Result<String, ConnectionError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            break;
        }
        if line.len() > MAX_AUTH_LINE {
            return Err(ConnectionError::Auth("handshake line too long".into()));
        }
    }
    String::from_utf8(line).map_err(|_| ConnectionError::Auth("non-UTF-8 handshake".into()))
}
