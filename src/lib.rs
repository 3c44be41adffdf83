//! Library crate for webreactor: an epoll-driven static-file HTTP server.
//!
//! The **binary** (`main.rs`) only parses flags, installs the tracing subscriber and runs a
//! [`dispatcher::Dispatcher`]. Everything below the dispatcher (buffer, parser, response
//! builder, timer heap, worker pool) is plain library code with its own unit tests, and
//! the dispatcher itself can be driven one `turn` at a time from integration tests.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod constants;
pub mod dispatcher;
pub mod metrics;
pub mod reactor;
pub mod request;
pub mod response;
pub mod signals;
pub mod timer;
pub mod users;
pub mod worker_pool;

pub use config::ServerConfig;
pub use dispatcher::{Dispatcher, ServerError, ShutdownHandle};
