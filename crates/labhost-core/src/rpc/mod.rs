//! JSON-RPC clients for services running on, or serving, lab hosts.
//!
//! [`RpcProxy`] speaks JSON-RPC 2.0 over HTTP POST. Construction performs no
//! network I/O; the first [`RpcProxy::call`] opens the connection. The
//! bootstrapper in [`bootstrap`] starts a server on the DUT and hands back a
//! proxy bound through an SSH tunnel.

pub mod bootstrap;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::trace;

pub use self::bootstrap::{RpcLaunch, connect, jsonrpc_connect};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from an RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Nothing is listening yet.
    #[error("connection to {url} refused: {reason}")]
    ConnectionRefused {
        /// Endpoint URL.
        url: String,
        /// Underlying error.
        reason: String,
    },

    /// The HTTP exchange failed or returned a non-success status.
    #[error("protocol error from {url}: {reason}")]
    Protocol {
        /// Endpoint URL.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// The response body was not a JSON-RPC response.
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        /// Endpoint URL.
        url: String,
        /// Parse failure.
        reason: String,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("rpc fault {code} from {method}: {message}")]
    Fault {
        /// Called method.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// Server message.
        message: String,
    },

    /// The request did not complete in time.
    #[error("request to {url} timed out")]
    Timeout {
        /// Endpoint URL.
        url: String,
    },

    /// The HTTP client could not be built.
    #[error("failed to build rpc client: {reason}")]
    Client {
        /// Builder error.
        reason: String,
    },
}

impl RpcError {
    /// Errors a starting server produces before it is ready.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. } | Self::Protocol { .. } | Self::MalformedResponse { .. }
        )
    }

    fn from_reqwest(url: &str, error: &reqwest::Error) -> Self {
        let url = url.to_string();
        if error.is_timeout() {
            Self::Timeout { url }
        } else if error.is_connect() {
            Self::ConnectionRefused {
                url,
                reason: error.to_string(),
            }
        } else if error.is_decode() {
            Self::MalformedResponse {
                url,
                reason: error.to_string(),
            }
        } else {
            Self::Protocol {
                url,
                reason: error.to_string(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<FaultObject>,
}

#[derive(Debug, Deserialize)]
struct FaultObject {
    code: i64,
    message: String,
}

/// Decodes a JSON-RPC 2.0 response body.
fn decode_response(url: &str, method: &str, body: &str) -> Result<Value, RpcError> {
    let envelope: ResponseEnvelope =
        serde_json::from_str(body).map_err(|e| RpcError::MalformedResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    match (envelope.result, envelope.error) {
        (_, Some(fault)) => Err(RpcError::Fault {
            method: method.to_string(),
            code: fault.code,
            message: fault.message,
        }),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(Value::Null),
    }
}

/// A lazily-connected JSON-RPC 2.0 client.
#[derive(Debug)]
pub struct RpcProxy {
    url: String,
    client: reqwest::blocking::Client,
    next_id: AtomicU64,
}

impl RpcProxy {
    /// Creates a proxy for `url` with the default request timeout.
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a proxy whose requests give up after `timeout`.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Client {
                reason: e.to_string(),
            })?;

        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Calls `method` with `params` (an array or object).
    pub fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        trace!(url = %self.url, method, id, "rpc call");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .map_err(|e| RpcError::from_reqwest(&self.url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Protocol {
                url: self.url.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        let body = response
            .text()
            .map_err(|e| RpcError::from_reqwest(&self.url, &e))?;
        decode_response(&self.url, method, &body)
    }

    /// Calls a method that takes no arguments.
    pub fn call0(&self, method: &str) -> Result<Value, RpcError> {
        self.call(method, Value::Array(Vec::new()))
    }
}
