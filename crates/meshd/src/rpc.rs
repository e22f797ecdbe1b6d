//! Placeholder RPC dispatcher.
//!
//! The real JSON-RPC dispatcher is an external collaborator; until one is
//! wired in, every request gets a well-formed method-not-found error so
//! SDK clients fail loudly instead of hanging.

use async_trait::async_trait;
use serde_json::{json, Value};

use mesh_core::interfaces::RpcDispatcher;

pub struct UnimplementedRpc;

#[async_trait]
impl RpcDispatcher for UnimplementedRpc {
    async fn dispatch(
        &self,
        body: &[u8],
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let id = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .unwrap_or(Value::Null);
        let response = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "method not found" },
        });
        Ok(serde_json::to_vec(&response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_the_request_id() {
        let body = br#"{"jsonrpc":"2.0","id":42,"method":"getBlockNumber"}"#;
        let response = UnimplementedRpc.dispatch(body).await.unwrap();
        let parsed: Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(parsed["id"], 42);
        assert_eq!(parsed["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn garbage_body_still_answers() {
        let response = UnimplementedRpc.dispatch(b"not json").await.unwrap();
        let parsed: Value = serde_json::from_slice(&response).unwrap();
        assert!(parsed["id"].is_null());
    }
}
