use super::application::Application;
use super::constants::*;
use super::types::RegistrationState;
use crate::bus::{Connection, ObjectPath, Proxy, Value};
use crate::error::{Error, Result};
use log::{info, warn};

/// Completion of a registration request; runs once on the event loop thread
pub type RegistrationCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Proxy for the daemon's `GattManager1` on one adapter
#[derive(Debug, Clone)]
pub struct GattManager {
    proxy: Proxy,
}

impl GattManager {
    pub fn new(conn: &Connection, service: &str, adapter_path: &ObjectPath) -> Self {
        Self {
            proxy: Proxy::new(conn, service, adapter_path, GATT_MANAGER_INTERFACE),
        }
    }

    fn fail_later(&self, callback: RegistrationCallback, error: Error) {
        self.proxy
            .connection()
            .post(move |_| callback(Err(error)));
    }

    /// Registers `app` with the daemon, exporting it first if needed
    ///
    /// The outcome is delivered to `callback`; a second registration of the
    /// same application fails with `AlreadyExists` without a bus call.
    pub fn register_application<F>(
        &self,
        app: &Application,
        options: Vec<(String, Value)>,
        callback: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let callback: RegistrationCallback = Box::new(callback);
        if app.state() != RegistrationState::Unregistered {
            warn!("Application {} is already registered", app.path());
            self.fail_later(
                callback,
                Error::Registration {
                    name: BLUEZ_ERROR_ALREADY_EXISTS.to_string(),
                    message: format!("Application {} already registered", app.path()),
                },
            );
            return;
        }

        if !app.is_exported() {
            if let Err(e) = app.export(self.proxy.connection()) {
                self.fail_later(callback, e);
                return;
            }
        }

        app.set_state(RegistrationState::Registering);
        let app = app.clone();
        self.proxy.call_async(
            "RegisterApplication",
            vec![
                Value::ObjectPath(app.path().clone()),
                Value::property_map(options),
            ],
            move |reply| match reply {
                Ok(_) => {
                    app.set_state(RegistrationState::Registered);
                    info!("GATT application {} registered", app.path());
                    callback(Ok(()));
                }
                Err(e) => {
                    app.set_state(RegistrationState::Unregistered);
                    let e = e.into_registration();
                    warn!("Failed to register GATT application {}: {}", app.path(), e);
                    callback(Err(e));
                }
            },
        );
    }

    /// Asks the daemon to drop `app`; the tree stays exported
    pub fn unregister_application<F>(&self, app: &Application, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let callback: RegistrationCallback = Box::new(callback);
        if app.state() != RegistrationState::Registered {
            self.fail_later(
                callback,
                Error::Registration {
                    name: BLUEZ_ERROR_DOES_NOT_EXIST.to_string(),
                    message: format!("Application {} is not registered", app.path()),
                },
            );
            return;
        }

        let app = app.clone();
        self.proxy.call_async(
            "UnregisterApplication",
            vec![Value::ObjectPath(app.path().clone())],
            move |reply| match reply {
                Ok(_) => {
                    app.set_state(RegistrationState::Unregistered);
                    info!("GATT application {} unregistered", app.path());
                    callback(Ok(()));
                }
                Err(e) => callback(Err(e.into_registration())),
            },
        );
    }

    /// Blocking form of [`unregister_application`](Self::unregister_application)
    ///
    /// Usable after the event loop has stopped; the reply is pumped inline.
    pub fn unregister_application_blocking(&self, app: &Application) -> Result<()> {
        if app.state() != RegistrationState::Registered {
            return Err(Error::Registration {
                name: BLUEZ_ERROR_DOES_NOT_EXIST.to_string(),
                message: format!("Application {} is not registered", app.path()),
            });
        }
        self.proxy
            .call(
                "UnregisterApplication",
                vec![Value::ObjectPath(app.path().clone())],
            )
            .map_err(Error::into_registration)?;
        app.set_state(RegistrationState::Unregistered);
        info!("GATT application {} unregistered", app.path());
        Ok(())
    }
}
