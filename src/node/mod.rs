//! The consensus core and everything layered on committed log entries
//!
//! A `Node` owns one replica: role state, the durable binlog/meta/KV
//! containers, the apply loop, per-peer replicators, sessions, watches,
//! users, and snapshot transfer. The gRPC surface in [`rpc`] is a thin
//! translation layer over [`api`].

pub mod api;
pub mod apply;
pub mod client;
pub mod election;
pub mod perf;
pub mod replication;
pub mod rpc;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod users;
pub mod watch;

pub use rpc::NodeService;
pub use server::Node;
pub use state::NodeRole;
