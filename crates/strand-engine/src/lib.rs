//! strand-engine: the core of strand.
//!
//! This crate provides:
//!
//! - **Engine**: the job registry, dispatcher, and serving loop
//! - **Streams**: the per-job multiplexer of named byte channels
//! - **Connector**: the transport abstraction — in-process [`PipeHub`],
//!   unix sockets, TCP to a remote broker — with identical semantics
//!   whichever wire backs it
//! - **Proxy**: a duplex byte relay fronting a backend connector
//! - **Jobs**: the built-in handlers (`exec`, `mount`, `unmount`) and the
//!   not-implemented stubs
//! - **Db**: the key/value side-channel contract handed to handlers
//! - **Layers**: union-filesystem drivers used by the mount jobs

pub mod connector;
pub mod db;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod layers;
pub mod pipe;
pub mod proxy;
pub mod registry;
pub mod socket;
pub mod streams;
pub mod wire;

pub use connector::{BoxedConn, Conn, Connector, PipeHub};
pub use db::{Db, MemoryDb};
pub use engine::{Engine, JobHook};
pub use error::{EngineError, EngineResult, StreamDirection};
pub use pipe::{byte_pipe, PipeReader, PipeWriter};
pub use proxy::{proxy, relay};
pub use registry::{Env, HandlerFn, HandlerRegistry, JobHandler};
pub use socket::{SocketConnector, TcpConnector};
pub use streams::Streams;
pub use wire::Frame;
