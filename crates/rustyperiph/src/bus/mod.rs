//! Bus transport
//!
//! A self-contained client for the D-Bus wire protocol over Unix stream
//! sockets: value marshalling, message framing, authentication, method
//! calls with reply tracking, signals and exported objects.

pub mod auth;
pub mod codec;
pub mod connection;
pub mod constants;
pub mod message;
pub mod object;
pub mod proxy;
pub mod types;

pub use auth::BusAddress;
pub use connection::{Connection, EventLoopThread, SignalMatch, WeakConnection};
pub use message::{Message, MessageFlags, MessageType};
pub use object::{Interface, MethodCall, MethodSpec};
pub use proxy::Proxy;
pub use types::{ObjectPath, Type, Value};

#[cfg(test)]
mod tests;
