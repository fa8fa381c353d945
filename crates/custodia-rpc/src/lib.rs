//! # custodia-rpc — JSON-RPC node client.
//!
//! Implements [`custodia_core::traits::NodeClient`] against a
//! Bitcoin-Core-style JSON-RPC endpoint over HTTP. Transport failures map
//! to the transient error class; the node's "invalid or non-existent"
//! error code maps to not-found.

pub mod client;

pub use client::{RpcClient, RpcClientConfig};
