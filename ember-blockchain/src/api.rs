//! JSON-RPC 2.0 API server
//!
//! A thin translator from HTTP onto the `NodeApi` capability: every method
//! maps 1:1 onto a core call. The HTTP handling is deliberately minimal
//! (`POST /` for JSON-RPC, `GET /health` for liveness).

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::node::NodeApi;
use crate::types::Transaction;

const MAX_REQUEST_BYTES: usize = 256 * 1024;

/// JSON-RPC error codes
pub const ERR_INVALID_REQUEST: i32 = -32600;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_APPLICATION: i32 = -32000;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// HTTP server exposing the node's JSON-RPC surface
pub struct RpcServer {
    api: NodeApi,
    port: u16,
}

impl RpcServer {
    pub fn new(api: NodeApi, port: u16) -> Self {
        Self { api, port }
    }

    /// Bind and serve in a background task
    pub async fn start(self) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("Failed to bind RPC port {}", self.port))?;
        info!(port = self.port, "JSON-RPC server listening");

        let api = Arc::new(self.api);
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let api = Arc::clone(&api);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(&api, stream).await {
                                debug!(error = %e, "RPC connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "RPC accept failed");
                        break;
                    }
                }
            }
        }))
    }
}

async fn handle_connection(api: &NodeApi, mut stream: TcpStream) -> anyhow::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    // read headers, then the content-length body
    let (head_end, request) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("request too large");
        }
        if let Some(pos) = find_header_end(&buffer) {
            break (pos, String::from_utf8_lossy(&buffer[..pos]).to_string());
        }
    };

    let mut lines = request.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    while buffer.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("request too large");
        }
    }
    let body = String::from_utf8_lossy(&buffer[body_start..(body_start + content_length).min(buffer.len())])
        .to_string();

    let (status, response_body) = match (method.as_str(), path.as_str()) {
        ("POST", "/") => {
            let response = match serde_json::from_str::<JsonRpcRequest>(&body) {
                Ok(request) => {
                    debug!(method = %request.method, "rpc request");
                    let id = request.id.clone();
                    match dispatch(api, &request.method, &request.params).await {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(error) => JsonRpcResponse::failure(id, error),
                    }
                }
                Err(e) => JsonRpcResponse::failure(
                    Value::Null,
                    RpcError::new(ERR_INVALID_REQUEST, format!("Invalid request: {e}")),
                ),
            };
            ("200 OK", serde_json::to_string(&response)?)
        }
        ("GET", "/health") => (
            "200 OK",
            json!({
                "status": "ok",
                "height": api.chain_height(),
                "timestamp": Utc::now().timestamp(),
            })
            .to_string(),
        ),
        _ => ("404 Not Found", json!({"error": "Not found"}).to_string()),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response_body.len(),
        response_body
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Positional (`[value]`) or named (`{key: value}`) string parameter
fn extract_string(params: &Value, key: &str) -> Result<String, RpcError> {
    let value = match params {
        Value::Array(items) => items.first().and_then(Value::as_str),
        Value::Object(map) => map.get(key).and_then(Value::as_str),
        _ => None,
    };
    value
        .map(str::to_string)
        .ok_or_else(|| RpcError::invalid_params(format!("Missing parameter: {key}")))
}

fn params_object(params: &Value) -> Result<&serde_json::Map<String, Value>, RpcError> {
    match params {
        Value::Object(map) => Ok(map),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_object)
            .ok_or_else(|| RpcError::invalid_params("Expected a parameter object")),
        _ => Err(RpcError::invalid_params("Expected a parameter object")),
    }
}

/// Route one JSON-RPC method onto the NodeApi
pub async fn dispatch(api: &NodeApi, method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        "eth_getBalance" => {
            let address = extract_string(params, "address")?;
            Ok(json!({ "address": address, "balance": api.get_balance(&address) }))
        }

        "eth_getAccountState" => {
            let address = extract_string(params, "address")?;
            Ok(json!({
                "address": address,
                "balance": api.get_balance(&address),
                "nonce": api.get_nonce(&address).unwrap_or(0),
                "state_root": api.state_root(),
            }))
        }

        "eth_getAccountNonce" => {
            let address = extract_string(params, "address")?;
            Ok(json!({
                "address": address,
                "nonce": api.get_nonce(&address).unwrap_or(0),
                "next_nonce": api.expected_nonce(&address),
            }))
        }

        "eth_sendTransaction" => {
            let obj = params_object(params)?;
            let from = obj
                .get("from")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("Missing parameter: from"))?
                .to_string();
            let to = obj
                .get("to")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::invalid_params("Missing parameter: to"))?
                .to_string();
            let amount = obj
                .get("amount")
                .and_then(Value::as_f64)
                .ok_or_else(|| RpcError::invalid_params("Missing parameter: amount"))?;
            let gas_price = obj.get("gas_price").and_then(Value::as_f64).unwrap_or(0.0);
            let nonce = obj
                .get("nonce")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| api.expected_nonce(&from));

            let mut tx = Transaction::new(&from, &to, amount, gas_price, nonce);
            if let Some(ts) = obj.get("timestamp").and_then(Value::as_str) {
                tx.timestamp = ts.to_string();
            }
            let tx = match (
                obj.get("public_key").and_then(Value::as_str),
                obj.get("signature").and_then(Value::as_str),
            ) {
                (Some(public_key), Some(signature)) => tx.finalize(public_key, signature),
                // simplified identity profile for locally built transactions
                _ => tx.finalize(&from, "rpc"),
            };

            let nonce = tx.nonce;
            match api.submit_transaction(tx).await {
                Ok(tx_hash) => Ok(json!({ "tx_hash": tx_hash, "status": "pending", "nonce": nonce })),
                Err(e) => Err(RpcError::new(ERR_APPLICATION, e.to_string())),
            }
        }

        "eth_getBlockByNumber" => {
            let number = match params {
                Value::Array(items) => items.first().and_then(Value::as_u64),
                Value::Object(map) => map.get("number").and_then(Value::as_u64),
                _ => None,
            }
            .ok_or_else(|| RpcError::invalid_params("Missing parameter: number"))?;
            match api.block_by_index(number) {
                Some(block) => {
                    Ok(serde_json::to_value(block).map_err(|e| RpcError::new(ERR_APPLICATION, e.to_string()))?)
                }
                None => Err(RpcError::invalid_params("Block not found")),
            }
        }

        "eth_blockNumber" => {
            let height = api.chain_height();
            Ok(json!({ "number": height, "height": height }))
        }

        "eth_getBlockByHash" => {
            let hash = extract_string(params, "hash")?;
            match api.block_by_hash(&hash) {
                Some(block) => {
                    Ok(serde_json::to_value(block).map_err(|e| RpcError::new(ERR_APPLICATION, e.to_string()))?)
                }
                None => Err(RpcError::invalid_params("Block not found")),
            }
        }

        "eth_getNetworkStats" => Ok(json!({
            "total_blocks": api.chain_height(),
            "total_transactions": api.total_transactions(),
            "total_accounts": api.account_count(),
            "peer_count": api.peer_count().await,
            "difficulty": api.difficulty(),
            "mempool_size": api.mempool_size(),
            "state_root": api.state_root(),
        })),

        "net_peerCount" => Ok(json!({ "peer_count": api.peer_count().await })),

        "eth_chainHeight" => Ok(json!({ "height": api.chain_height() })),

        "eth_startMining" => {
            api.start_mining();
            Ok(json!({ "status": "mining_started" }))
        }

        "eth_stopMining" => {
            api.stop_mining();
            Ok(json!({ "status": "mining_stopped" }))
        }

        _ => Err(RpcError::new(ERR_METHOD_NOT_FOUND, format!("Method not found: {method}"))),
    }
}
