//! RPC dispatch core: instances, call records and the dispatch context.

mod call;
mod context;
mod instance;

use std::sync::Arc;

use crate::value::Value;

pub use call::{Call, CallEvent, HandlerReturn, LocalCall};
pub use context::Context;
pub use instance::Instance;

pub(crate) use call::Sink;

/// Interface assigned to methods registered without an explicit one.
pub const DEFAULT_INTERFACE: &str = "io.ferry.Default";

/// A registered method body. Receives the call handle (the cookie used
/// for replies) and the argument value; the return value follows the
/// sentinel semantics of [`HandlerReturn`].
pub type Handler = Arc<dyn Fn(&Call, &Value) -> HandlerReturn + Send + Sync>;

/// Runs before every handler. Returning `Some(value)` skips the handler
/// and makes that value the reply.
pub type PreCallHook = Arc<dyn Fn(&Call, &Value) -> Option<Value> + Send + Sync>;

/// Runs on the outgoing singular reply and may transform it.
pub type PostCallHook = Arc<dyn Fn(&Call, Value) -> Value + Send + Sync>;
