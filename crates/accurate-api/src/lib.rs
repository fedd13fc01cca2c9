//! API layer for Accurate
//!
//! - `POST /cdr_http` generic `name=value` CDRs
//! - `POST /freeswitch_json` FreeSWITCH JSON CDRs
//! - `POST /jsonrpc` the engine's RPC methods
//! - `GET /health`

#![forbid(unsafe_code)]

pub mod dto;
pub mod handlers;

pub use dto::{RpcRequest, RpcResponse};
pub use handlers::configure;
