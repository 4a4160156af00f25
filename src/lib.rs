//! Job coordination between a server and the agents that run jobs.
//!
//! The server resolves job requests against a resource catalog into frozen
//! specifications and owns every job's status. Agents claim jobs, run them
//! through a fixed sequence of stages and stream the job directory back so
//! the server can serve live files.

pub mod agent;
pub mod catalog;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod model;
pub mod node;
pub mod resolver;
pub mod rpc;
pub mod server;
pub mod shutdown;
