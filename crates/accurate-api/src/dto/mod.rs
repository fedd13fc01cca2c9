//! Wire types of the HTTP surface

pub mod rpc;

pub use rpc::{RpcRequest, RpcResponse};
