//! Client-side handle to a remote object

use super::connection::Connection;
use super::constants::PROPERTIES_INTERFACE;
use super::message::Message;
use super::types::{ObjectPath, Value};
use crate::error::{Error, ProtocolError, Result};

/// One interface of a remote object
#[derive(Debug, Clone)]
pub struct Proxy {
    connection: Connection,
    destination: String,
    path: ObjectPath,
    interface: String,
}

impl Proxy {
    pub fn new(connection: &Connection, destination: &str, path: &ObjectPath, interface: &str) -> Self {
        Self {
            connection: connection.clone(),
            destination: destination.to_string(),
            path: path.clone(),
            interface: interface.to_string(),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Builds a call to `member` on this interface
    pub fn message(&self, member: &str, args: Vec<Value>) -> Message {
        Message::method_call(
            Some(&self.destination),
            &self.path,
            &self.interface,
            member,
            args,
        )
    }

    /// Calls a method and waits for the reply body
    pub fn call(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let reply = self.connection.call_method(self.message(member, args))?;
        Ok(reply.body)
    }

    /// Calls a method; `callback` receives the reply body
    pub fn call_async<F>(&self, member: &str, args: Vec<Value>, callback: F) -> u32
    where
        F: FnOnce(Result<Vec<Value>>) + Send + 'static,
    {
        self.connection.call_method_async(
            self.message(member, args),
            Box::new(move |reply| callback(reply.map(|msg| msg.body))),
        )
    }

    fn properties_call(&self, member: &str, mut args: Vec<Value>) -> Result<Vec<Value>> {
        args.insert(0, Value::Str(self.interface.clone()));
        let msg = Message::method_call(
            Some(&self.destination),
            &self.path,
            PROPERTIES_INTERFACE,
            member,
            args,
        );
        Ok(self.connection.call_method(msg)?.body)
    }

    /// Reads one property
    pub fn get(&self, name: &str) -> Result<Value> {
        let body = self.properties_call("Get", vec![Value::Str(name.to_string())])?;
        match body.into_iter().next() {
            Some(value) => Ok(value.flatten().clone()),
            None => Err(Error::Protocol(ProtocolError::UnexpectedSignature {
                expected: "v".into(),
                actual: String::new(),
            })),
        }
    }

    /// Writes one property
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        self.properties_call(
            "Set",
            vec![Value::Str(name.to_string()), Value::variant(value)],
        )?;
        Ok(())
    }

    /// Reads all properties of the interface
    pub fn get_all(&self) -> Result<Vec<(String, Value)>> {
        let body = self.properties_call("GetAll", Vec::new())?;
        body.first()
            .and_then(Value::to_property_list)
            .ok_or_else(|| {
                Error::Protocol(ProtocolError::UnexpectedSignature {
                    expected: "a{sv}".into(),
                    actual: body.iter().map(Value::signature).collect(),
                })
            })
    }
}
