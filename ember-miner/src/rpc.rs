//! Blocking JSON-RPC 2.0 client for a running node

use anyhow::{anyhow, Context, Result};
use ember_blockchain::types::Transaction;
use serde_json::{json, Value};

pub struct RpcClient {
    url: String,
    http: reqwest::blocking::Client,
}

impl RpcClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .with_context(|| format!("RPC request to {} failed", self.url))?
            .json()
            .context("Invalid RPC response")?;

        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(anyhow!("RPC error {code}: {message}"));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("RPC response missing result"))
    }

    pub fn get_balance(&self, address: &str) -> Result<f64> {
        let result = self.call("eth_getBalance", json!([address]))?;
        result
            .get("balance")
            .and_then(Value::as_f64)
            .ok_or_else(|| anyhow!("malformed balance response"))
    }

    /// The nonce the account's next transaction must carry
    pub fn next_nonce(&self, address: &str) -> Result<u64> {
        let result = self.call("eth_getAccountNonce", json!([address]))?;
        result
            .get("next_nonce")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("malformed nonce response"))
    }

    /// Submit a fully signed transaction
    pub fn send_transaction(&self, tx: &Transaction) -> Result<String> {
        let params = serde_json::to_value(tx).context("Failed to serialize transaction")?;
        let result = self.call("eth_sendTransaction", params)?;
        result
            .get("tx_hash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("malformed send response"))
    }

    pub fn chain_height(&self) -> Result<u64> {
        let result = self.call("eth_chainHeight", Value::Null)?;
        result
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("malformed height response"))
    }

    pub fn network_stats(&self) -> Result<Value> {
        self.call("eth_getNetworkStats", Value::Null)
    }

    pub fn start_mining(&self) -> Result<()> {
        self.call("eth_startMining", Value::Null).map(|_| ())
    }

    pub fn stop_mining(&self) -> Result<()> {
        self.call("eth_stopMining", Value::Null).map(|_| ())
    }
}
