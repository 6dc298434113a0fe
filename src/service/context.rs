//! The dispatch context: instance tree, hooks and call routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::connection::ConnectionShared;
use crate::error::Error;
use crate::typing::{IfMember, Registry};
use crate::value::Value;

use super::call::Sink;
use super::{
    Call, HandlerReturn, Instance, LocalCall, PostCallHook, PreCallHook, DEFAULT_INTERFACE,
};

pub(crate) struct ContextShared {
    root: Instance,
    instances: RwLock<HashMap<String, Instance>>,
    pre_hook: RwLock<Option<PreCallHook>>,
    post_hook: RwLock<Option<PostCallHook>>,
    registry: RwLock<Option<Arc<Registry>>>,
    connections: Mutex<Vec<Weak<ConnectionShared>>>,
    next_call_id: AtomicU64,
}

impl ContextShared {
    /// Multicasts an event to every live connection holding a matching
    /// subscription, pruning dead connections on the way.
    pub(crate) fn broadcast_event(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        payload: &Value,
    ) {
        let mut connections = self.connections.lock();
        connections.retain(|weak| weak.strong_count() > 0);
        for weak in connections.iter() {
            if let Some(connection) = weak.upgrade() {
                connection.notify_event(path, interface, name, payload);
            }
        }
    }

    pub(crate) fn register_connection(&self, connection: Weak<ConnectionShared>) {
        self.connections.lock().push(connection);
    }
}

/// Owns the instance tree and routes inbound calls to handlers.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextShared>,
}

impl Context {
    /// Fresh context holding only the root instance at `/`.
    pub fn new() -> Context {
        let root = Instance::root_instance();
        let mut instances = HashMap::new();
        instances.insert("/".to_string(), root.clone());

        let inner = Arc::new(ContextShared {
            root: root.clone(),
            instances: RwLock::new(instances),
            pre_hook: RwLock::new(None),
            post_hook: RwLock::new(None),
            registry: RwLock::new(None),
            connections: Mutex::new(Vec::new()),
            next_call_id: AtomicU64::new(1),
        });
        root.attach_context(&inner);
        Context { inner }
    }

    pub(crate) fn from_shared(inner: Arc<ContextShared>) -> Context {
        Context { inner }
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.inner
    }

    pub fn root(&self) -> Instance {
        self.inner.root.clone()
    }

    pub fn find_instance(&self, path: &str) -> Option<Instance> {
        self.inner.instances.read().get(path).cloned()
    }

    /// Adds an instance to the tree. Registration refuses duplicates.
    pub fn register_instance(&self, instance: Instance) -> Result<(), Error> {
        let mut instances = self.inner.instances.write();
        if instances.contains_key(instance.path()) {
            return Err(Error::Invalid(format!(
                "instance path '{}' already registered",
                instance.path()
            )));
        }
        instance.attach_context(&self.inner);
        instances.insert(instance.path().to_string(), instance);
        Ok(())
    }

    pub fn unregister_instance(&self, path: &str) -> Result<(), Error> {
        if path == "/" {
            return Err(Error::Invalid("the root instance cannot be removed".into()));
        }
        match self.inner.instances.write().remove(path) {
            Some(instance) => {
                instance.detach_context();
                Ok(())
            }
            None => Err(Error::NotFound(format!("instance '{}'", path))),
        }
    }

    /// Registers a method on the root instance.
    pub fn register_method(
        &self,
        interface: Option<&str>,
        name: &str,
        handler: super::Handler,
    ) -> Result<(), Error> {
        self.inner.root.register_method(interface, name, handler)
    }

    pub fn unregister_method(&self, interface: Option<&str>, name: &str) -> Result<(), Error> {
        self.inner.root.unregister_method(interface, name)
    }

    /// Installs a hook running before every handler. An error value
    /// returned by the hook skips the handler and becomes the reply.
    pub fn set_pre_call_hook(&self, hook: PreCallHook) {
        *self.inner.pre_hook.write() = Some(hook);
    }

    /// Installs a hook that may transform every outgoing singular reply.
    pub fn set_post_call_hook(&self, hook: PostCallHook) {
        *self.inner.post_hook.write() = Some(hook);
    }

    /// Attaches a type registry, enabling argument validation for calls
    /// on interfaces with loaded descriptors and typed (de)serialisation
    /// at the connection boundary.
    pub fn attach_registry(&self, registry: Arc<Registry>) {
        *self.inner.registry.write() = Some(registry);
    }

    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.inner.registry.read().clone()
    }

    /// Local synchronous call to a method on the root instance,
    /// bypassing any transport.
    pub fn dispatch_call(&self, name: &str, args: Value) -> Result<LocalCall, Error> {
        self.dispatch_call_at("/", None, name, args)
    }

    /// Local call to an arbitrary (path, interface, method) target.
    pub fn dispatch_call_at(
        &self,
        path: &str,
        interface: Option<&str>,
        method: &str,
        args: Value,
    ) -> Result<LocalCall, Error> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink: Sink = Box::new(move |event| {
            let _ = tx.lock().send(event);
        });
        let call = self.dispatch(path, interface.unwrap_or(DEFAULT_INTERFACE), method, args, sink)?;
        Ok(LocalCall::new(call, rx))
    }

    /// Ingress entry point: locates the target, builds the call record
    /// and runs the handler on the calling thread. Reply events flow
    /// through `sink`. Lookup failures are returned to the caller, which
    /// converts them into error frames.
    pub(crate) fn dispatch(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Value,
        sink: Sink,
    ) -> Result<Call, Error> {
        let instance = self
            .find_instance(path)
            .ok_or_else(|| Error::NotFound(format!("instance '{}'", path)))?;
        let record = instance.find_method(interface, method).ok_or_else(|| {
            Error::NotFound(format!("method '{}' on interface '{}'", method, interface))
        })?;

        let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let post_hook = self.inner.post_hook.read().clone();
        let call = Call::new(
            id,
            path,
            interface,
            method,
            args,
            sink,
            post_hook,
            Arc::downgrade(&self.inner),
        );

        debug!(path, interface, method, id, "dispatching call");

        if let Some(error) = self.validate_args(interface, method, call.args()) {
            call.error_ex(error);
            return Ok(call);
        }

        let pre_hook = self.inner.pre_hook.read().clone();
        if let Some(hook) = pre_hook {
            if let Some(reply) = hook(&call, call.args()) {
                if reply.as_error().is_some() {
                    call.error_ex(reply);
                } else {
                    call.respond(reply);
                }
                return Ok(call);
            }
        }

        match (record.handler)(&call, call.args()) {
            HandlerReturn::Single(value) => call.respond(value),
            HandlerReturn::StillRunning => {}
            HandlerReturn::None => {
                if call.is_running() {
                    call.respond(Value::null());
                }
            }
        }

        Ok(call)
    }

    /// Validates an argument bundle against the declared method
    /// signature, when a registry and a matching interface descriptor
    /// are available. Returns the error reply on failure.
    fn validate_args(&self, interface: &str, method: &str, args: &Value) -> Option<Value> {
        let registry = self.inner.registry.read().clone()?;
        let descriptor = registry.interface(interface)?;
        let IfMember::Method { args: declared, .. } = descriptor.method(method)? else {
            return None;
        };
        let supplied = args.as_array()?;

        let mut violations = Vec::new();
        if supplied.len() != declared.len() {
            violations.push(Value::dictionary_from([
                ("path", Value::string("")),
                (
                    "message",
                    Value::string(format!(
                        "method '{}' takes {} arguments, {} given",
                        method,
                        declared.len(),
                        supplied.len()
                    )),
                ),
            ]));
        } else {
            for (argument, value) in declared.iter().zip(supplied) {
                for violation in registry.validate(argument.type_instance(), value) {
                    violations.push(Value::dictionary_from([
                        (
                            "path",
                            Value::string(format!("{}{}", argument.name(), violation.path)),
                        ),
                        ("message", Value::string(&violation.message)),
                    ]));
                }
            }
        }

        if violations.is_empty() {
            return None;
        }
        Some(Value::error(
            libc::EINVAL,
            "argument validation failed",
            Value::array(violations),
        ))
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_dispatch_root_method() {
        let context = Context::new();
        context
            .register_method(
                None,
                "double",
                Arc::new(|_call, args| {
                    let n = args.as_i64().unwrap_or(0);
                    HandlerReturn::Single(Value::int64(n * 2))
                }),
            )
            .unwrap();

        let call = context.dispatch_call("double", Value::int64(21)).unwrap();
        assert_eq!(call.wait().unwrap().as_i64(), Some(42));
    }

    #[test]
    fn test_missing_method_is_not_found() {
        let context = Context::new();
        assert!(matches!(
            context.dispatch_call("nope", Value::null()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_instance_dispatch() {
        let context = Context::new();
        let instance = Instance::new("/calc").unwrap();
        instance
            .register_method(
                Some("io.test.Calc"),
                "add",
                Arc::new(|_call, args| {
                    let a = args.array_get(0).and_then(Value::as_i64).unwrap_or(0);
                    let b = args.array_get(1).and_then(Value::as_i64).unwrap_or(0);
                    HandlerReturn::Single(Value::int64(a + b))
                }),
            )
            .unwrap();
        context.register_instance(instance).unwrap();

        let call = context
            .dispatch_call_at(
                "/calc",
                Some("io.test.Calc"),
                "add",
                Value::array([Value::int64(2), Value::int64(3)]),
            )
            .unwrap();
        assert_eq!(call.wait().unwrap().as_i64(), Some(5));
    }

    #[test]
    fn test_duplicate_instance_refused() {
        let context = Context::new();
        context
            .register_instance(Instance::new("/a").unwrap())
            .unwrap();
        assert!(context
            .register_instance(Instance::new("/a").unwrap())
            .is_err());
    }

    #[test]
    fn test_unregister_instance() {
        let context = Context::new();
        context
            .register_instance(Instance::new("/a").unwrap())
            .unwrap();
        context.unregister_instance("/a").unwrap();
        assert!(context.unregister_instance("/a").is_err());
        assert!(context.unregister_instance("/").is_err());
    }

    #[test]
    fn test_implicit_null_reply() {
        let context = Context::new();
        context
            .register_method(None, "noop", Arc::new(|_c, _a| HandlerReturn::None))
            .unwrap();
        let call = context.dispatch_call("noop", Value::null()).unwrap();
        assert!(call.wait().unwrap().is_null());
    }

    #[test]
    fn test_explicit_respond_beats_return_value() {
        let context = Context::new();
        context
            .register_method(
                None,
                "m",
                Arc::new(|call, _args| {
                    call.respond(Value::int64(1));
                    HandlerReturn::None
                }),
            )
            .unwrap();
        let call = context.dispatch_call("m", Value::null()).unwrap();
        assert_eq!(call.wait().unwrap().as_i64(), Some(1));
    }

    #[test]
    fn test_streaming_dispatch() {
        let context = Context::new();
        context
            .register_method(
                None,
                "stream",
                Arc::new(|call, _args| {
                    call.yield_fragment(Value::int64(1)).unwrap();
                    call.yield_fragment(Value::int64(2)).unwrap();
                    call.end();
                    HandlerReturn::None
                }),
            )
            .unwrap();

        let call = context.dispatch_call("stream", Value::null()).unwrap();
        let values = call.collect_stream().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1].as_i64(), Some(2));
    }

    #[test]
    fn test_handler_error_reply() {
        let context = Context::new();
        context
            .register_method(
                None,
                "fail",
                Arc::new(|call, _args| {
                    call.error(libc::EIO, "disk on fire");
                    HandlerReturn::None
                }),
            )
            .unwrap();

        let call = context.dispatch_call("fail", Value::null()).unwrap();
        match call.wait() {
            Err(Error::Remote(error)) => {
                assert_eq!(error.error_code(), Some(libc::EIO));
                assert_eq!(error.error_message(), Some("disk on fire"));
                // Remote errors carry the originating stack.
                assert!(error.as_error().unwrap().stack.as_str().is_some());
            }
            other => panic!("expected a remote error, got {:?}", other.map(|v| v.describe())),
        }
    }

    #[test]
    fn test_pre_hook_rejects_call() {
        let context = Context::new();
        context
            .register_method(
                None,
                "guarded",
                Arc::new(|_c, _a| HandlerReturn::Single(Value::int64(1))),
            )
            .unwrap();
        context.set_pre_call_hook(Arc::new(|_call, _args| {
            Some(Value::error(libc::EACCES, "denied", Value::null()))
        }));

        let call = context.dispatch_call("guarded", Value::null()).unwrap();
        match call.wait() {
            Err(Error::Remote(error)) => assert_eq!(error.error_code(), Some(libc::EACCES)),
            other => panic!("expected denial, got {:?}", other.map(|v| v.describe())),
        }
    }

    #[test]
    fn test_post_hook_transforms_reply() {
        let context = Context::new();
        context
            .register_method(
                None,
                "m",
                Arc::new(|_c, _a| HandlerReturn::Single(Value::int64(10))),
            )
            .unwrap();
        context.set_post_call_hook(Arc::new(|_call, value| {
            Value::int64(value.as_i64().unwrap_or(0) + 1)
        }));

        let call = context.dispatch_call("m", Value::null()).unwrap();
        assert_eq!(call.wait().unwrap().as_i64(), Some(11));
    }

    #[test]
    fn test_still_running_async_reply() {
        let context = Context::new();
        context
            .register_method(
                None,
                "later",
                Arc::new(|call, _args| {
                    let handle = call.clone();
                    std::thread::spawn(move || {
                        handle.respond(Value::string("done"));
                    });
                    HandlerReturn::StillRunning
                }),
            )
            .unwrap();

        let call = context.dispatch_call("later", Value::null()).unwrap();
        assert_eq!(call.wait().unwrap().as_str(), Some("done"));
    }

    #[test]
    fn test_argument_validation_rejects_bad_args() {
        use crate::typing::Registry;

        let registry = Arc::new(Registry::new());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("calc.json"),
            r#"{
                "module": "io.test",
                "interface Calc": {
                    "methods": {
                        "add": {
                            "return": "int64",
                            "args": [
                                {"name": "a", "type": "int64"},
                                {"name": "b", "type": "int64"}
                            ]
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        registry.load_dir(dir.path()).unwrap();

        let context = Context::new();
        context.attach_registry(registry);
        context
            .register_method(
                Some("io.test.Calc"),
                "add",
                Arc::new(|_c, args| {
                    let a = args.array_get(0).and_then(Value::as_i64).unwrap_or(0);
                    let b = args.array_get(1).and_then(Value::as_i64).unwrap_or(0);
                    HandlerReturn::Single(Value::int64(a + b))
                }),
            )
            .unwrap();

        let good = context
            .dispatch_call_at(
                "/",
                Some("io.test.Calc"),
                "add",
                Value::array([Value::int64(1), Value::int64(2)]),
            )
            .unwrap();
        assert_eq!(good.wait().unwrap().as_i64(), Some(3));

        let bad = context
            .dispatch_call_at(
                "/",
                Some("io.test.Calc"),
                "add",
                Value::array([Value::int64(1), Value::string("two")]),
            )
            .unwrap();
        match bad.wait() {
            Err(Error::Remote(error)) => {
                assert_eq!(error.error_code(), Some(libc::EINVAL));
                let extra = &error.as_error().unwrap().extra;
                assert_eq!(extra.array_len(), 1);
            }
            other => panic!("expected EINVAL, got {:?}", other.map(|v| v.describe())),
        }
    }

    #[test]
    fn test_events_drop_without_connections() {
        let context = Context::new();
        let instance = Instance::new("/emitter").unwrap();
        context.register_instance(instance.clone()).unwrap();
        // No connections registered: multicast is a no-op.
        instance
            .emit_event("io.test.Calc", "changed", Value::int64(1))
            .unwrap();
    }
}
