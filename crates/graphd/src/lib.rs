//! In-memory graph database server core.
//!
//! Named graphs of keyed vertices and weighted edges, mirrored into a field
//! index, driven through a line protocol. Each graph serializes its commands
//! on one executor while lightweight actors bound to graph objects and
//! pub/sub channels run alongside it.

pub mod algo;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod index;
pub mod process;
pub mod properties;
pub mod protocol;
pub mod server;
pub mod store;

pub use config::Config;
pub use error::{GraphError, ProcessError, Result};
pub use graph::Graph;
pub use server::{ClientState, Flow, ServerState, Session};
