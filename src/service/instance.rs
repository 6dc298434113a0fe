//! Path-addressable instances publishing interfaces and methods.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::Error;
use crate::value::Value;

use super::context::ContextShared;
use super::{Handler, DEFAULT_INTERFACE};

#[derive(Clone)]
pub(crate) struct MethodRecord {
    pub interface: String,
    pub name: String,
    pub handler: Handler,
}

pub(crate) struct InstanceShared {
    path: String,
    data: Option<Arc<dyn Any + Send + Sync>>,
    // interface -> method name -> record
    methods: RwLock<HashMap<String, HashMap<String, MethodRecord>>>,
    context: RwLock<Weak<ContextShared>>,
}

/// A path-addressable object publishing methods grouped by interface.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceShared>,
}

impl Instance {
    /// Creates a detached instance for the given absolute path.
    pub fn new(path: &str) -> Result<Instance, Error> {
        Instance::build(path, None)
    }

    /// Like [`Instance::new`], additionally carrying opaque user data
    /// retrievable with [`Instance::data`].
    pub fn with_data<T: Any + Send + Sync>(path: &str, data: T) -> Result<Instance, Error> {
        Instance::build(path, Some(Arc::new(data)))
    }

    /// The root instance every context starts with.
    pub(crate) fn root_instance() -> Instance {
        Instance {
            inner: Arc::new(InstanceShared {
                path: "/".to_string(),
                data: None,
                methods: RwLock::new(HashMap::new()),
                context: RwLock::new(Weak::new()),
            }),
        }
    }

    fn build(path: &str, data: Option<Arc<dyn Any + Send + Sync>>) -> Result<Instance, Error> {
        if !path.starts_with('/') {
            return Err(Error::Invalid(format!(
                "instance path '{}' is not absolute",
                path
            )));
        }
        Ok(Instance {
            inner: Arc::new(InstanceShared {
                path: path.to_string(),
                data,
                methods: RwLock::new(HashMap::new()),
                context: RwLock::new(Weak::new()),
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Downcasts the opaque user data attached at construction.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner
            .data
            .as_deref()
            .and_then(|d| d.downcast_ref::<T>())
    }

    /// Registers a method handler under `(interface, name)`. The default
    /// interface is used when none is given. Duplicates are refused.
    pub fn register_method(
        &self,
        interface: Option<&str>,
        name: &str,
        handler: Handler,
    ) -> Result<(), Error> {
        let interface = interface.unwrap_or(DEFAULT_INTERFACE);
        let mut methods = self.inner.methods.write();
        let table = methods.entry(interface.to_string()).or_default();
        if table.contains_key(name) {
            return Err(Error::Invalid(format!(
                "method '{}' already registered on interface '{}'",
                name, interface
            )));
        }
        table.insert(
            name.to_string(),
            MethodRecord {
                interface: interface.to_string(),
                name: name.to_string(),
                handler,
            },
        );
        Ok(())
    }

    pub fn unregister_method(&self, interface: Option<&str>, name: &str) -> Result<(), Error> {
        let interface = interface.unwrap_or(DEFAULT_INTERFACE);
        let mut methods = self.inner.methods.write();
        let removed = methods
            .get_mut(interface)
            .and_then(|table| table.remove(name));
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!(
                "method '{}' on interface '{}'",
                name, interface
            ))),
        }
    }

    pub(crate) fn find_method(&self, interface: &str, name: &str) -> Option<MethodRecord> {
        self.inner
            .methods
            .read()
            .get(interface)
            .and_then(|table| table.get(name))
            .cloned()
    }

    /// Interfaces with at least one registered method.
    pub fn interfaces(&self) -> Vec<String> {
        self.inner.methods.read().keys().cloned().collect()
    }

    /// Method names registered under `interface`.
    pub fn method_names(&self, interface: &str) -> Vec<String> {
        self.inner
            .methods
            .read()
            .get(interface)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Multicasts an event from this instance to every connection
    /// subscribed to `(path, interface, name)` on the owning context.
    pub fn emit_event(&self, interface: &str, name: &str, payload: Value) -> Result<(), Error> {
        let context = self.inner.context.read().upgrade().ok_or_else(|| {
            Error::NotFound("instance is not registered with a context".into())
        })?;
        context.broadcast_event(self.path(), interface, name, &payload);
        Ok(())
    }

    pub(crate) fn attach_context(&self, context: &Arc<ContextShared>) {
        *self.inner.context.write() = Arc::downgrade(context);
    }

    pub(crate) fn detach_context(&self) {
        *self.inner.context.write() = Weak::new();
    }
}

#[cfg(test)]
mod tests {
    use super::super::HandlerReturn;
    use super::*;

    fn nop_handler() -> Handler {
        Arc::new(|_call, _args| HandlerReturn::None)
    }

    #[test]
    fn test_path_must_be_absolute() {
        assert!(Instance::new("/a/b").is_ok());
        assert!(Instance::new("relative").is_err());
    }

    #[test]
    fn test_register_and_find() {
        let instance = Instance::new("/svc").unwrap();
        instance
            .register_method(Some("io.test.Calc"), "add", nop_handler())
            .unwrap();

        assert!(instance.find_method("io.test.Calc", "add").is_some());
        assert!(instance.find_method("io.test.Calc", "sub").is_none());
        assert!(instance.find_method("io.test.Other", "add").is_none());
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let instance = Instance::new("/svc").unwrap();
        instance.register_method(None, "m", nop_handler()).unwrap();
        assert!(instance.register_method(None, "m", nop_handler()).is_err());
    }

    #[test]
    fn test_default_interface() {
        let instance = Instance::new("/svc").unwrap();
        instance.register_method(None, "m", nop_handler()).unwrap();
        assert!(instance.find_method(DEFAULT_INTERFACE, "m").is_some());
    }

    #[test]
    fn test_unregister() {
        let instance = Instance::new("/svc").unwrap();
        instance.register_method(None, "m", nop_handler()).unwrap();
        instance.unregister_method(None, "m").unwrap();
        assert!(instance.unregister_method(None, "m").is_err());
        assert!(instance.find_method(DEFAULT_INTERFACE, "m").is_none());
    }

    #[test]
    fn test_user_data() {
        let instance = Instance::with_data("/svc", 42u32).unwrap();
        assert_eq!(instance.data::<u32>(), Some(&42));
        assert_eq!(instance.data::<String>(), None);
    }

    #[test]
    fn test_emit_event_requires_context() {
        let instance = Instance::new("/svc").unwrap();
        assert!(instance
            .emit_event("io.test.Calc", "changed", Value::null())
            .is_err());
    }
}
