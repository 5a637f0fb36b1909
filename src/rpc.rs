//! JSON-RPC client shared by node and wallet handles.
//!
//! One call, one endpoint, bounded retries. The transport is a trait so tests
//! can swap the HTTP layer for a counting or failing stub; the shipped
//! implementation posts through `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::error::{TestnetError, TestnetResult};

/// Version tag sent on every request.
pub const JSON_RPC_VERSION: &str = "2.0";

/// Attempts made before a call is declared failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Pause between consecutive attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    result: Option<Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct JsonRpcErrorBody {
    code: i32,
    message: String,
    data: Option<Value>,
}

/// Delivers one serialized request and returns the raw response body.
///
/// Implementations must not retry; the retry budget belongs to [`RpcClient`].
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn roundtrip(&self, endpoint: &str, body: &Value) -> anyhow::Result<Value>;
}

/// Default transport: HTTP POST via `reqwest`.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn roundtrip(&self, endpoint: &str, body: &Value) -> anyhow::Result<Value> {
        let response = self.client.post(endpoint).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("http status {}", status);
        }
        Ok(response.json::<Value>().await?)
    }
}

/// A JSON-RPC endpoint plus a retry policy.
///
/// Transient transport failures (connection refused, timeout, non-2xx,
/// unparseable body) all consume one attempt each and are retried after
/// a fixed delay. A well-formed response carrying a structured `error`
/// member is not a transport failure and surfaces immediately as
/// [`TestnetError::Rpc`].
#[derive(Clone)]
pub struct RpcClient {
    endpoint: String,
    transport: Arc<dyn RpcTransport>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl RpcClient {
    /// Client over the default HTTP transport.
    pub fn new(endpoint: impl Into<String>) -> TestnetResult<Self> {
        let transport = Arc::new(HttpTransport::new()?);
        Ok(Self::with_transport(endpoint, transport))
    }

    /// Client over a caller-supplied transport (used by tests to count or
    /// fail attempts deterministically).
    pub fn with_transport(endpoint: impl Into<String>, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            endpoint: endpoint.into(),
            transport,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the retry policy. A budget of zero attempts is rejected on
    /// the next call, before anything is sent.
    pub fn retry_policy(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `method` with `params`, returning the `result` member.
    pub async fn call(&self, method: &str, params: Value) -> TestnetResult<Value> {
        if self.max_attempts == 0 {
            return Err(TestnetError::EmptyRetryBudget);
        }

        let request = json!({
            "jsonrpc": JSON_RPC_VERSION,
            "id": rand::random::<u32>(),
            "method": method,
            "params": params,
        });

        let mut last_response = None;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                debug!(
                    "retrying '{}' against {} (attempt {}/{})",
                    method, self.endpoint, attempt, self.max_attempts
                );
                sleep(self.retry_delay).await;
            }

            match self.transport.roundtrip(&self.endpoint, &request).await {
                Ok(body) => match serde_json::from_value::<JsonRpcResponse>(body.clone()) {
                    Ok(response) => {
                        if let Some(error) = response.error {
                            return Err(TestnetError::Rpc {
                                method: method.to_string(),
                                code: error.code,
                                message: error.message,
                            });
                        }
                        return Ok(response.result.unwrap_or(Value::Null));
                    }
                    Err(err) => {
                        debug!("malformed response from {}: {}", self.endpoint, err);
                        last_response = Some(body.to_string());
                    }
                },
                Err(err) => {
                    last_response = Some(err.to_string());
                }
            }
        }

        warn!(
            "giving up on '{}' against {} after {} attempts",
            method, self.endpoint, self.max_attempts
        );
        Err(TestnetError::Communication {
            endpoint: self.endpoint.clone(),
            method: method.to_string(),
            payload: request,
            attempts: self.max_attempts,
            last_response,
        })
    }
}
