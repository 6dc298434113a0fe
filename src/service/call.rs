//! Per-call state: the reply state machine and cooperative cancellation.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Error;
use crate::value::Value;

use super::context::ContextShared;
use super::{Context, PostCallHook};

/// Sentinel-bearing result of a handler invocation.
pub enum HandlerReturn {
    /// Implicit singular reply with this value.
    Single(Value),
    /// The handler transferred responsibility to an asynchronous path;
    /// the call stays live until respond/error/end is invoked on a clone
    /// of the call handle.
    StillRunning,
    /// Nothing to add: an implicit null reply unless the handler already
    /// produced a terminal event.
    None,
}

/// One outbound event of a call. A well-behaved call emits either one
/// `Reply`, one `Error`, or any number of `Fragment`s followed by one
/// `End` or `Error`.
#[derive(Clone, Debug, PartialEq)]
pub enum CallEvent {
    Reply(Value),
    Error(Value),
    Fragment { seq: u64, value: Value },
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallState {
    Running,
    Streaming,
    Replied,
    Errored,
    StreamEnded,
    Aborted,
}

impl CallState {
    fn is_terminal(self) -> bool {
        !matches!(self, CallState::Running | CallState::Streaming)
    }
}

pub(crate) type Sink = Box<dyn Fn(CallEvent) + Send + Sync>;

struct CallShared {
    id: u64,
    path: String,
    interface: String,
    method: String,
    args: Value,
    state: Mutex<CallState>,
    aborted: AtomicBool,
    seq: AtomicU64,
    sink: Sink,
    post_hook: Option<PostCallHook>,
    context: Weak<ContextShared>,
}

/// Handle to a live call record: the cookie handed to handlers. Clones
/// share the record, so an asynchronous handler may move one into
/// another thread and reply from there.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallShared>,
}

impl Call {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        path: &str,
        interface: &str,
        method: &str,
        args: Value,
        sink: Sink,
        post_hook: Option<PostCallHook>,
        context: Weak<ContextShared>,
    ) -> Call {
        Call {
            inner: Arc::new(CallShared {
                id,
                path: path.to_string(),
                interface: interface.to_string(),
                method: method.to_string(),
                args,
                state: Mutex::new(CallState::Running),
                aborted: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                sink,
                post_hook,
                context,
            }),
        }
    }

    /// Unique cookie of the call record.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn interface(&self) -> &str {
        &self.inner.interface
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Argument value, retained for the duration of the call.
    pub fn args(&self) -> &Value {
        &self.inner.args
    }

    /// The context the call is executing under, if it is still alive.
    pub fn context(&self) -> Option<Context> {
        self.inner.context.upgrade().map(Context::from_shared)
    }

    /// Sends the singular reply. Valid once, while the call is running;
    /// a second reply (or a reply on a streaming call) is dropped with a
    /// warning.
    pub fn respond(&self, value: Value) {
        let mut state = self.inner.state.lock();
        if *state != CallState::Running {
            warn!(method = %self.inner.method, state = ?*state, "respond ignored");
            return;
        }
        *state = CallState::Replied;
        drop(state);

        let value = match &self.inner.post_hook {
            Some(hook) => hook(self, value),
            None => value,
        };
        (self.inner.sink)(CallEvent::Reply(value));
    }

    /// Sends an error reply built from a code and message, capturing the
    /// current stack for the remote side.
    pub fn error(&self, code: i32, message: &str) {
        let stack = Value::string(Backtrace::force_capture().to_string());
        self.error_ex(Value::error_with_stack(code, message, Value::null(), stack));
    }

    /// Sends a prebuilt error value. In a streaming call this implicitly
    /// ends the stream.
    pub fn error_ex(&self, error: Value) {
        let mut state = self.inner.state.lock();
        if state.is_terminal() {
            warn!(method = %self.inner.method, state = ?*state, "error ignored");
            return;
        }
        *state = CallState::Errored;
        drop(state);
        (self.inner.sink)(CallEvent::Error(error));
    }

    /// Emits the next fragment of a streaming response. Returns an error
    /// once the caller has aborted, signalling the handler to unwind;
    /// the stream is ended implicitly at that point.
    pub fn yield_fragment(&self, fragment: Value) -> Result<(), Error> {
        if self.inner.aborted.load(Ordering::Acquire) {
            let mut state = self.inner.state.lock();
            if !state.is_terminal() {
                *state = CallState::Aborted;
                drop(state);
                (self.inner.sink)(CallEvent::End);
            }
            return Err(Error::Aborted);
        }

        let mut state = self.inner.state.lock();
        match *state {
            CallState::Running | CallState::Streaming => {
                *state = CallState::Streaming;
                drop(state);
                let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                (self.inner.sink)(CallEvent::Fragment {
                    seq,
                    value: fragment,
                });
                Ok(())
            }
            other => {
                warn!(method = %self.inner.method, state = ?other, "yield ignored");
                Err(Error::CallState("yield on a terminated call"))
            }
        }
    }

    /// Ends a streaming response. On a call that never yielded this is
    /// equivalent to a null reply.
    pub fn end(&self) {
        let mut state = self.inner.state.lock();
        match *state {
            CallState::Streaming => {
                *state = CallState::StreamEnded;
                drop(state);
                (self.inner.sink)(CallEvent::End);
            }
            CallState::Running => {
                drop(state);
                self.respond(Value::null());
            }
            other => {
                warn!(method = %self.inner.method, state = ?other, "end ignored");
            }
        }
    }

    /// Flags the call as aborted by the caller. Cancellation is
    /// cooperative: the handler observes it through [`Call::should_abort`]
    /// or a failing [`Call::yield_fragment`].
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::Release);
    }

    /// True once the caller has cancelled the call.
    pub fn should_abort(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.inner.state.lock().is_terminal()
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.inner.state.lock() == CallState::Running
    }
}

/// A locally dispatched call: drains the reply events the handler (or
/// its asynchronous continuation) produces.
pub struct LocalCall {
    call: Call,
    rx: mpsc::Receiver<CallEvent>,
}

impl LocalCall {
    pub(crate) fn new(call: Call, rx: mpsc::Receiver<CallEvent>) -> LocalCall {
        LocalCall { call, rx }
    }

    /// The underlying call handle, usable for aborting.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Blocks for the next reply event.
    pub fn recv(&self) -> Result<CallEvent, Error> {
        self.rx.recv().map_err(|_| Error::ConnectionClosed)
    }

    /// Waits for a singular reply, converting an error reply into
    /// [`Error::Remote`].
    pub fn wait(&self) -> Result<Value, Error> {
        match self.recv()? {
            CallEvent::Reply(value) => Ok(value),
            CallEvent::Error(error) => Err(Error::Remote(error)),
            CallEvent::Fragment { .. } | CallEvent::End => {
                Err(Error::CallState("streaming reply to a singular wait"))
            }
        }
    }

    /// Collects a streaming response: every fragment in order, ending on
    /// end-of-stream. An error reply fails the collection.
    pub fn collect_stream(&self) -> Result<Vec<Value>, Error> {
        let mut out = Vec::new();
        loop {
            match self.recv()? {
                CallEvent::Fragment { value, .. } => out.push(value),
                CallEvent::End => return Ok(out),
                CallEvent::Error(error) => return Err(Error::Remote(error)),
                CallEvent::Reply(_) => {
                    return Err(Error::CallState("singular reply in a stream"))
                }
            }
        }
    }

    /// Signals abort to the running handler.
    pub fn abort(&self) {
        self.call.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak as SyncWeak;

    fn test_call() -> (Call, mpsc::Receiver<CallEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let call = Call::new(
            1,
            "/",
            "test",
            "method",
            Value::null(),
            Box::new(move |ev| {
                let _ = tx.lock().send(ev);
            }),
            None,
            SyncWeak::new(),
        );
        (call, rx)
    }

    #[test]
    fn test_single_reply_terminal() {
        let (call, rx) = test_call();
        call.respond(Value::int64(1));
        call.respond(Value::int64(2));
        assert_eq!(rx.try_recv().unwrap(), CallEvent::Reply(Value::int64(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_after_reply_ignored() {
        let (call, rx) = test_call();
        call.respond(Value::int64(1));
        call.error(1, "too late");
        assert_eq!(rx.try_recv().unwrap(), CallEvent::Reply(Value::int64(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_then_end() {
        let (call, rx) = test_call();
        call.yield_fragment(Value::int64(1)).unwrap();
        call.yield_fragment(Value::int64(2)).unwrap();
        call.end();

        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::Fragment {
                seq: 0,
                value: Value::int64(1)
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::Fragment {
                seq: 1,
                value: Value::int64(2)
            }
        );
        assert_eq!(rx.try_recv().unwrap(), CallEvent::End);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_end_without_stream_is_null_reply() {
        let (call, rx) = test_call();
        call.end();
        assert_eq!(rx.try_recv().unwrap(), CallEvent::Reply(Value::null()));
    }

    #[test]
    fn test_error_ends_stream() {
        let (call, rx) = test_call();
        call.yield_fragment(Value::int64(1)).unwrap();
        call.error(5, "boom");
        // No further events accepted.
        assert!(call.yield_fragment(Value::int64(2)).is_err());

        assert!(matches!(
            rx.try_recv().unwrap(),
            CallEvent::Fragment { .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), CallEvent::Error(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_abort_observed_by_yield() {
        let (call, rx) = test_call();
        call.yield_fragment(Value::int64(1)).unwrap();
        assert!(!call.should_abort());

        call.abort();
        assert!(call.should_abort());
        assert!(matches!(
            call.yield_fragment(Value::int64(2)),
            Err(Error::Aborted)
        ));

        // First fragment, then the implicit end-of-stream.
        assert!(matches!(
            rx.try_recv().unwrap(),
            CallEvent::Fragment { .. }
        ));
        assert_eq!(rx.try_recv().unwrap(), CallEvent::End);
    }

    #[test]
    fn test_respond_after_abort_observed() {
        let (call, rx) = test_call();
        call.abort();
        let _ = call.yield_fragment(Value::int64(1));
        call.respond(Value::int64(2));
        assert_eq!(rx.try_recv().unwrap(), CallEvent::End);
        assert!(rx.try_recv().is_err());
    }
}
