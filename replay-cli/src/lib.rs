//! Server crate for the replay buffer: configuration, gRPC dispatch and the
//! per-stream handlers.

pub mod config;
pub mod grpc;
pub mod streams;
