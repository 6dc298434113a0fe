//! ferry - typed, self-describing object RPC.
//!
//! Exchanges tagged object graphs (including open file descriptors and
//! shared memory handles) between processes over stream transports. The
//! crate is built from three layers: the dynamic [`Value`] model, the
//! declared type system in [`typing`], and the dispatch core in
//! [`service`], with a socket transport and JSON frame codec on top.

pub mod codec;
pub mod connection;
pub mod error;
pub mod service;
pub mod transport;
pub mod typing;
pub mod value;

pub use connection::{ClientCall, Connection, EventStream, Server};
pub use error::Error;
pub use service::{
    Call, CallEvent, Context, Handler, HandlerReturn, Instance, LocalCall, PostCallHook,
    PreCallHook, DEFAULT_INTERFACE,
};
pub use transport::Credentials;
pub use typing::{Interface, Registry, Type, TypeClass, TypeInstance, Violation};
pub use value::{Kind, PackArg, Slot, Value};

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
