//! JSON-RPC over HTTP POST

use std::sync::Arc;

use accurate_engine::Engine;
use actix_web::web::{Data, Json};
use tracing::instrument;

use crate::dto::{RpcRequest, RpcResponse};

/// Dispatches one call to the engine's method table
///
/// Errors travel inside the envelope, the HTTP status is always 200.
#[instrument(skip(engine, req), fields(method = %req.method))]
pub async fn jsonrpc(req: Json<RpcRequest>, engine: Data<Arc<Engine>>) -> Json<RpcResponse> {
    let RpcRequest { method, params, id } = req.into_inner();
    let res = engine.call(&method, params).await;
    Json(RpcResponse::from_result(id, res))
}
