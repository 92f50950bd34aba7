//! Node agent engine
//!
//! Supervises proxy-core backend processes (xray, sing-box) on one
//! node: launches them against validated configuration snapshots,
//! restarts them on crash within a failure budget, and exposes the
//! whole lifecycle over a mutually-authenticated gRPC control channel.
//!
//! Layering, outermost first:
//! - `adapters::grpc` and `transport` carry the control channel
//! - `supervisor` serializes lifecycle operations and drives crash
//!   recovery
//! - `config_store`, `runner` and `logs` are the working parts one
//!   level down
//! - `domain` holds the entities and the state machine, free of I/O

pub mod adapters;
pub mod bootstrap;
pub mod config_store;
pub mod domain;
pub mod logs;
pub mod runner;
pub mod supervisor;
pub mod transport;

pub mod proto {
    pub mod node_agent {
        tonic::include_proto!("node_agent");
    }
}
