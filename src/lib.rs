// src/lib.rs
//! A small, high-throughput HTTP server core.
//!
//! Multi-reactor design: an acceptor thread round-robins accepted sockets
//! into per-CPU epoll workers. Each worker drives one step-driven coroutine
//! per connection, translating coroutine suspensions into edge-triggered
//! interest changes, and reaps idle connections through a ring-buffered
//! death queue. A prefix trie routes matched requests to pluggable
//! handlers.
//!
//! ```no_run
//! use tern::{Config, Mount, Response, Request, Router, Server, Status};
//! use tern::router::HandlerState;
//!
//! fn hello(_req: &Request, resp: &mut Response, _state: Option<&HandlerState>) -> Status {
//!     resp.buffer.extend_from_slice(b"hello, world");
//!     Status::Ok
//! }
//!
//! fn main() -> tern::TernResult<()> {
//!     let mut router = Router::new();
//!     router.rebuild(vec![Mount::callback("/", hello)]);
//!
//!     let mut server = Server::new(Config::default(), router)?;
//!     server.run()
//! }
//! ```
pub mod conn;
pub mod coro;
pub mod error;
pub mod http;
pub mod metrics;
pub mod request;
pub mod router;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod worker;

pub use conn::{Conn, ConnFlags, QueryParam};
pub use error::{TernError, TernResult};
pub use http::{
    mime_type_for_file_name, status_as_descriptive_string, status_as_string, Method, Response,
    Status,
};
pub use metrics::MetricsSnapshot;
pub use request::Request;
pub use router::{Handler, HandlerState, Mount, MountKind, ParseFlags, Router};
pub use server::{Config, Server, ShutdownHandle};
