//! Exported objects and built-in interfaces
//!
//! Objects are registered on a [`Connection`](super::Connection) as a set of
//! [`Interface`] implementations. The connection answers the standard
//! `Properties`, `Introspectable`, `Peer` and `ObjectManager` interfaces on
//! their behalf.

use super::connection::Connection;
use super::constants::*;
use super::message::Message;
use super::types::{ObjectPath, Type, Value};
use crate::error::MethodError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

/// Introspection data for one method
#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub name: &'static str,
    /// Input signature
    pub inputs: &'static str,
    /// Output signature
    pub outputs: &'static str,
}

/// An incoming method call handed to an [`Interface`]
pub struct MethodCall<'a> {
    pub connection: &'a Connection,
    pub message: &'a Message,
}

impl<'a> MethodCall<'a> {
    pub fn member(&self) -> &str {
        self.message.member()
    }

    pub fn args(&self) -> &[Value] {
        &self.message.body
    }

    /// Argument `index`, or an `InvalidArgs` error
    pub fn arg(&self, index: usize) -> Result<&Value, MethodError> {
        self.message.body.get(index).ok_or_else(|| {
            MethodError::new(
                DBUS_ERROR_INVALID_ARGS,
                format!("Missing argument {} for {}", index, self.member()),
            )
        })
    }

    pub fn sender(&self) -> Option<&str> {
        self.message.sender.as_deref()
    }
}

/// A bus interface implemented by an exported object
pub trait Interface: Send + Sync {
    /// Fully qualified interface name
    fn name(&self) -> &str;

    /// Handles a method call addressed to this interface
    fn call(&self, call: &MethodCall<'_>) -> Result<Vec<Value>, MethodError>;

    /// Current values of all readable properties
    fn properties(&self) -> Vec<(String, Value)>;

    /// Current value of a single property
    fn property(&self, name: &str) -> Option<Value> {
        self.properties()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Writes a property; read-only by default
    fn set_property(&self, name: &str, _value: &Value) -> Result<(), MethodError> {
        Err(MethodError::new(
            DBUS_ERROR_PROPERTY_READ_ONLY,
            format!("Property {} is read-only", name),
        ))
    }

    /// Methods advertised through introspection
    fn methods(&self) -> &[MethodSpec] {
        &[]
    }
}

/// Shorthand for an unknown method on an interface
pub fn unknown_method(interface: &str, member: &str) -> MethodError {
    MethodError::new(
        DBUS_ERROR_UNKNOWN_METHOD,
        format!("Unknown method {} on interface {}", member, interface),
    )
}

/// An object exported at a path
#[derive(Clone, Default)]
pub(crate) struct ExportedObject {
    pub(crate) interfaces: Vec<Arc<dyn Interface>>,
}

impl ExportedObject {
    fn interface(&self, name: &str) -> Option<Arc<dyn Interface>> {
        self.interfaces.iter().find(|i| i.name() == name).cloned()
    }
}

/// All objects exported on a connection
#[derive(Default)]
pub(crate) struct ObjectTree {
    objects: BTreeMap<ObjectPath, ExportedObject>,
    managers: BTreeSet<ObjectPath>,
}

impl ObjectTree {
    pub(crate) fn insert(&mut self, path: ObjectPath, object: ExportedObject) -> bool {
        if self.objects.contains_key(&path) {
            return false;
        }
        self.objects.insert(path, object);
        true
    }

    pub(crate) fn remove(&mut self, path: &ObjectPath) -> bool {
        self.managers.remove(path);
        self.objects.remove(path).is_some()
    }

    pub(crate) fn contains(&self, path: &ObjectPath) -> bool {
        self.objects.contains_key(path)
    }

    pub(crate) fn add_manager(&mut self, path: ObjectPath) {
        self.objects.entry(path.clone()).or_default();
        self.managers.insert(path);
    }

    fn get(&self, path: &ObjectPath) -> Option<ExportedObject> {
        self.objects.get(path).cloned()
    }

    fn is_manager(&self, path: &ObjectPath) -> bool {
        self.managers.contains(path)
    }

    fn descendants(&self, path: &ObjectPath) -> Vec<(ObjectPath, ExportedObject)> {
        self.objects
            .iter()
            .filter(|(p, _)| p.is_descendant_of(path))
            .map(|(p, o)| (p.clone(), o.clone()))
            .collect()
    }

    /// Names of the direct child nodes of `path`
    fn child_nodes(&self, path: &ObjectPath) -> BTreeSet<String> {
        let prefix_len = if path.as_str() == "/" {
            1
        } else {
            path.as_str().len() + 1
        };
        self.objects
            .keys()
            .filter(|p| p.is_descendant_of(path))
            .filter_map(|p| p.as_str()[prefix_len..].split('/').next().map(str::to_string))
            .collect()
    }
}

/// Snapshot of what a path looks like, taken so no lock is held while dispatching
struct Target {
    object: Option<ExportedObject>,
    is_manager: bool,
    children: BTreeSet<String>,
    managed: Vec<(ObjectPath, ExportedObject)>,
}

/// Dispatches a method call against the exported objects
pub(crate) fn dispatch(
    connection: &Connection,
    message: &Message,
) -> Result<Vec<Value>, MethodError> {
    let path = message
        .path
        .as_ref()
        .ok_or_else(|| MethodError::new(DBUS_ERROR_UNKNOWN_OBJECT, "Missing object path"))?;
    let member = message.member();
    let interface = message.interface.as_deref();

    let target = connection.with_objects(|tree| {
        let is_manager = tree.is_manager(path);
        Target {
            object: tree.get(path),
            is_manager,
            children: tree.child_nodes(path),
            managed: if is_manager && member == "GetManagedObjects" {
                tree.descendants(path)
            } else {
                Vec::new()
            },
        }
    });

    if interface == Some(INTROSPECTABLE_INTERFACE) && member == "Introspect" {
        if target.object.is_none() && target.children.is_empty() {
            return Err(unknown_object(path));
        }
        return Ok(vec![Value::Str(introspect(&target))]);
    }

    let object = target.object.as_ref().ok_or_else(|| unknown_object(path))?;
    let call = MethodCall {
        connection,
        message,
    };

    match interface {
        Some(PEER_INTERFACE) => match member {
            "Ping" => Ok(Vec::new()),
            _ => Err(unknown_method(PEER_INTERFACE, member)),
        },
        Some(PROPERTIES_INTERFACE) => handle_properties(connection, path, object, &call),
        Some(OBJECT_MANAGER_INTERFACE) if target.is_manager => match member {
            "GetManagedObjects" => Ok(vec![managed_objects(&target.managed)]),
            _ => Err(unknown_method(OBJECT_MANAGER_INTERFACE, member)),
        },
        Some(name) => {
            let iface = object.interface(name).ok_or_else(|| {
                MethodError::new(
                    DBUS_ERROR_UNKNOWN_INTERFACE,
                    format!("Object {} does not implement {}", path, name),
                )
            })?;
            iface.call(&call)
        }
        None => {
            // No interface given: first interface that knows the method wins
            let iface = object
                .interfaces
                .iter()
                .find(|i| i.methods().iter().any(|m| m.name == member))
                .ok_or_else(|| unknown_method("<none>", member))?;
            iface.call(&call)
        }
    }
}

fn unknown_object(path: &ObjectPath) -> MethodError {
    MethodError::new(
        DBUS_ERROR_UNKNOWN_OBJECT,
        format!("No object exported at {}", path),
    )
}

fn handle_properties(
    connection: &Connection,
    path: &ObjectPath,
    object: &ExportedObject,
    call: &MethodCall<'_>,
) -> Result<Vec<Value>, MethodError> {
    let interface_name = call.arg(0)?.as_str().unwrap_or("").to_string();
    let iface = object.interface(&interface_name).ok_or_else(|| {
        MethodError::new(
            DBUS_ERROR_UNKNOWN_INTERFACE,
            format!("Object {} does not implement {}", path, interface_name),
        )
    })?;

    match call.member() {
        "Get" => {
            let name = call.arg(1)?.as_str().unwrap_or("");
            let value = iface.property(name).ok_or_else(|| {
                MethodError::new(
                    DBUS_ERROR_UNKNOWN_PROPERTY,
                    format!("Unknown property {}.{}", interface_name, name),
                )
            })?;
            Ok(vec![Value::variant(value)])
        }
        "GetAll" => Ok(vec![Value::property_map(iface.properties())]),
        "Set" => {
            let name = call.arg(1)?.as_str().unwrap_or("").to_string();
            let value = call.arg(2)?.flatten().clone();
            if iface.property(&name).is_none() {
                return Err(MethodError::new(
                    DBUS_ERROR_UNKNOWN_PROPERTY,
                    format!("Unknown property {}.{}", interface_name, name),
                ));
            }
            iface.set_property(&name, &value)?;
            if let Some(current) = iface.property(&name) {
                if let Err(e) =
                    connection.emit_properties_changed(path, &interface_name, vec![(name, current)])
                {
                    log::warn!("Failed to emit PropertiesChanged for {}: {}", path, e);
                }
            }
            Ok(Vec::new())
        }
        other => Err(unknown_method(PROPERTIES_INTERFACE, other)),
    }
}

/// `a{oa{sa{sv}}}` for every managed object
fn managed_objects(objects: &[(ObjectPath, ExportedObject)]) -> Value {
    let entries = objects
        .iter()
        .map(|(path, object)| {
            let interfaces = object
                .interfaces
                .iter()
                .map(|iface| {
                    (
                        Value::Str(iface.name().to_string()),
                        Value::property_map(iface.properties()),
                    )
                })
                .collect();
            (
                Value::ObjectPath(path.clone()),
                Value::Dict(Type::Str, properties_type(), interfaces),
            )
        })
        .collect();
    Value::Dict(
        Type::ObjectPath,
        Type::Array(Box::new(Type::DictEntry(
            Box::new(Type::Str),
            Box::new(properties_type()),
        ))),
        entries,
    )
}

/// `a{sv}`
fn properties_type() -> Type {
    Type::Array(Box::new(Type::DictEntry(
        Box::new(Type::Str),
        Box::new(Type::Variant),
    )))
}

fn introspect(target: &Target) -> String {
    let mut xml = String::from(INTROSPECT_DOCTYPE);
    xml.push_str("<node>\n");
    if let Some(object) = &target.object {
        push_standard_interfaces(&mut xml, target.is_manager);
        for iface in &object.interfaces {
            let _ = writeln!(xml, "  <interface name=\"{}\">", iface.name());
            for method in iface.methods() {
                let _ = writeln!(xml, "    <method name=\"{}\">", method.name);
                push_args(&mut xml, method.inputs, "in");
                push_args(&mut xml, method.outputs, "out");
                xml.push_str("    </method>\n");
            }
            for (name, value) in iface.properties() {
                let _ = writeln!(
                    xml,
                    "    <property name=\"{}\" type=\"{}\" access=\"read\"/>",
                    name,
                    value.signature()
                );
            }
            xml.push_str("  </interface>\n");
        }
    }
    for child in &target.children {
        let _ = writeln!(xml, "  <node name=\"{}\"/>", child);
    }
    xml.push_str("</node>\n");
    xml
}

fn push_args(xml: &mut String, signature: &str, direction: &str) {
    if let Ok(types) = Type::parse_signature(signature) {
        for ty in types {
            let _ = writeln!(xml, "      <arg type=\"{}\" direction=\"{}\"/>", ty, direction);
        }
    }
}

fn push_standard_interfaces(xml: &mut String, is_manager: bool) {
    xml.push_str(concat!(
        "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n",
        "    <method name=\"Introspect\"><arg type=\"s\" direction=\"out\"/></method>\n",
        "  </interface>\n",
        "  <interface name=\"org.freedesktop.DBus.Peer\">\n",
        "    <method name=\"Ping\"/>\n",
        "  </interface>\n",
        "  <interface name=\"org.freedesktop.DBus.Properties\">\n",
        "    <method name=\"Get\"><arg type=\"s\" direction=\"in\"/><arg type=\"s\" direction=\"in\"/><arg type=\"v\" direction=\"out\"/></method>\n",
        "    <method name=\"GetAll\"><arg type=\"s\" direction=\"in\"/><arg type=\"a{sv}\" direction=\"out\"/></method>\n",
        "    <method name=\"Set\"><arg type=\"s\" direction=\"in\"/><arg type=\"s\" direction=\"in\"/><arg type=\"v\" direction=\"in\"/></method>\n",
        "    <signal name=\"PropertiesChanged\"><arg type=\"s\"/><arg type=\"a{sv}\"/><arg type=\"as\"/></signal>\n",
        "  </interface>\n",
    ));
    if is_manager {
        xml.push_str(concat!(
            "  <interface name=\"org.freedesktop.DBus.ObjectManager\">\n",
            "    <method name=\"GetManagedObjects\"><arg type=\"a{oa{sa{sv}}}\" direction=\"out\"/></method>\n",
            "  </interface>\n",
        ));
    }
}
