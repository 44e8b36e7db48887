//! Simple RPC client for node management
//!
//! Only what supervision needs: authenticated JSON-RPC calls and the
//! `getnetworkinfo` readiness check.

use super::config::Network;
use super::flags::LaunchOptions;
use crate::error::{NodeError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request timeout; a hung daemon counts as a failed attempt
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// RPC request structure
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

/// RPC response structure
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// RPC error structure
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

/// JSON-RPC client bound to one daemon's credentials
#[derive(Debug, Clone)]
pub struct RpcClient {
    url: String,
    username: String,
    password: String,
    network: Network,
    client: reqwest::Client,
}

impl RpcClient {
    pub fn new(
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        network: Network,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NodeError::Rpc(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: format!("http://127.0.0.1:{}", port),
            username: username.into(),
            password: password.into(),
            network,
            client,
        })
    }

    /// Client using the same credentials and port the daemon was launched with
    pub fn from_options(options: &LaunchOptions) -> Result<Self> {
        let network = Network::from_options(options);
        let port = match options.get("rpcport") {
            None => network.default_rpc_port(),
            Some(value) => match value.as_u16().filter(|port| *port != 0) {
                Some(port) => port,
                None => {
                    let fallback = network.default_rpc_port();
                    log::warn!(
                        "rpcport {:?} is not a usable port; connecting to {} instead",
                        value.to_string(),
                        fallback
                    );
                    fallback
                }
            },
        };
        let username = options.get("rpcuser").map(|v| v.to_string()).unwrap_or_default();
        let password = options
            .get("rpcpassword")
            .map(|v| v.to_string())
            .unwrap_or_default();

        Self::new(port, username, password, network)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Make an RPC call
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| NodeError::Rpc(format!("request failed: {}", e)))?;

        let status = response.status();
        let rpc_response: RpcResponse<T> = response.json().await.map_err(|e| {
            NodeError::Rpc(format!("Failed to parse RPC response (HTTP {}): {}", status, e))
        })?;

        if let Some(error) = rpc_response.error {
            return Err(NodeError::Rpc(format!("error {}: {}", error.code, error.message)));
        }

        rpc_response
            .result
            .ok_or_else(|| NodeError::Rpc("response missing result".to_string()))
    }

    /// Succeeds only once the daemon's network subsystem is up
    pub async fn get_network_info(&self) -> Result<serde_json::Value> {
        self.call("getnetworkinfo", vec![]).await
    }
}

/// One readiness attempt against a daemon
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

#[async_trait]
impl ReadinessProbe for RpcClient {
    async fn probe(&self) -> Result<()> {
        self.get_network_info().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::downloader::tests::serve;
    use crate::node::flags::OptionValue;

    fn client_for(base: &str) -> RpcClient {
        let port: u16 = base.rsplit(':').next().unwrap().parse().unwrap();
        RpcClient::new(port, "user", "pass", Network::Regtest).unwrap()
    }

    #[test]
    fn test_from_options_uses_launch_credentials() {
        let options = LaunchOptions::new()
            .with("rpcuser", "alice")
            .with("rpcpassword", "secret")
            .with("testnet", true);
        let client = RpcClient::from_options(&options).unwrap();
        assert_eq!(client.username(), "alice");
        assert_eq!(client.network(), Network::Testnet);
        assert_eq!(client.url(), "http://127.0.0.1:18332");
    }

    #[test]
    fn test_explicit_port_wins() {
        let options = LaunchOptions::new().with("regtest", true).with("rpcport", 20444u16);
        let client = RpcClient::from_options(&options).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:20444");

        let options = LaunchOptions::new().with("rpcport", "20555");
        let client = RpcClient::from_options(&options).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:20555");
    }

    #[test]
    fn test_unusable_port_falls_back_to_network_default() {
        for bad in [OptionValue::from("abc"), OptionValue::from(70000i64), OptionValue::from(0u16)] {
            let options = LaunchOptions::new().with("regtest", true).with("rpcport", bad);
            let client = RpcClient::from_options(&options).unwrap();
            assert_eq!(client.url(), "http://127.0.0.1:18443");
        }
    }

    #[tokio::test]
    async fn test_get_network_info() {
        let base = serve(
            200,
            br#"{"result":{"version":210000,"networkactive":true},"error":null,"id":1}"#.to_vec(),
        )
        .await;

        let info = client_for(&base).get_network_info().await.unwrap();
        assert_eq!(info["version"], 210000);
        assert!(client_for(&base).probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_rpc_error_is_reported() {
        let base = serve(
            500,
            br#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":1}"#.to_vec(),
        )
        .await;

        match client_for(&base).get_network_info().await {
            Err(NodeError::Rpc(message)) => assert!(message.contains("-28")),
            other => panic!("expected RPC error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_fails_probe() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = RpcClient::new(port, "u", "p", Network::Regtest).unwrap();
        assert!(client.probe().await.is_err());
    }
}
