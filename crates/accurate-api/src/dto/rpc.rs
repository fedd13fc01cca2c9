//! JSON-RPC 1.0 envelopes
//!
//! Requests carry `{"method": "Service.Method", "params": [...], "id": ...}`;
//! replies echo the id with exactly one of `result` and `error` non-null.

use accurate_core::AppResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn from_result(id: Value, res: AppResult<Value>) -> Self {
        match res {
            Ok(result) => Self {
                id,
                result,
                error: None,
            },
            Err(e) => Self {
                id,
                result: Value::Null,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accurate_core::AppError;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let req: RpcRequest = serde_json::from_str(r#"{"method":"Responder.Status"}"#).unwrap();
        assert_eq!(req.method, "Responder.Status");
        assert!(req.params.is_null());
        assert!(req.id.is_null());
    }

    #[test]
    fn test_error_reply_has_null_result() {
        let reply = RpcResponse::from_result(json!(7), Err(AppError::NotFound));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"id": 7, "result": null, "error": "NOT_FOUND"})
        );
    }
}
