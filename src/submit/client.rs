// ABOUTME: Target system client - sends payloads and performs enrichment lookups over HTTP
// ABOUTME: One shared classifier turns fault text into not-found vs real faults

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::payload::Operation;
use crate::config::TargetConfig;
use crate::record::flatten_strings;
use crate::utils::sanitize_url;

/// Fault text the target returns for an id it does not know.
pub const NOT_FOUND_FAULT: &str = "Invalid ID value";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Accepted,
    /// The target answered with a fault.
    Rejected(String),
    /// The request never got an answer.
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(BTreeMap<String, String>),
    NotFound,
    Fault(String),
}

/// Classify a fault returned by a lookup.
pub fn classify_fault(fault: &str) -> LookupResult {
    if fault.contains(NOT_FOUND_FAULT) {
        LookupResult::NotFound
    } else {
        LookupResult::Fault(fault.to_string())
    }
}

/// Writes must be upserts keyed by the record id: an unordered batch can be
/// redelivered whole after a partial run.
#[async_trait]
pub trait TargetClient: Send + Sync {
    async fn send(&self, operation: Operation, payload: &Value) -> SendResult;

    async fn lookup(&self, operation: Operation, request: &Value) -> LookupResult;
}

#[derive(Debug, Deserialize)]
struct FaultBody {
    faultstring: String,
}

fn fault_text(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<FaultBody>(body) {
        Ok(fault) => fault.faultstring,
        Err(_) if body.trim().is_empty() => format!("HTTP {}", status),
        Err(_) => format!("HTTP {}: {}", status, body.trim()),
    }
}

pub struct HttpTargetClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTargetClient {
    pub fn new(config: &TargetConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        tracing::info!("Target endpoint: {}", sanitize_url(&base_url));
        Ok(Self {
            client,
            base_url,
            api_key: config.resolved_api_key(),
        })
    }

    async fn post(&self, operation: Operation, body: &Value) -> reqwest::Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, operation.as_str());
        let mut request = self.client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            request = request.header("x-api-key", key);
        }
        request.send().await
    }
}

#[async_trait]
impl TargetClient for HttpTargetClient {
    async fn send(&self, operation: Operation, payload: &Value) -> SendResult {
        let response = match self.post(operation, payload).await {
            Ok(response) => response,
            Err(e) => return SendResult::Unreachable(format!("{} failed: {}", operation, e)),
        };
        let status = response.status();
        if status.is_success() {
            return SendResult::Accepted;
        }
        match response.text().await {
            Ok(body) => SendResult::Rejected(fault_text(status, &body)),
            Err(e) => SendResult::Unreachable(format!(
                "{} answered HTTP {} but the response body could not be read: {}",
                operation, status, e
            )),
        }
    }

    async fn lookup(&self, operation: Operation, request: &Value) -> LookupResult {
        let response = match self.post(operation, request).await {
            Ok(response) => response,
            Err(e) => return LookupResult::Fault(format!("{} failed: {}", operation, e)),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return LookupResult::Fault(format!(
                    "{} answered HTTP {} but the response body could not be read: {}",
                    operation, status, e
                ))
            }
        };
        if !status.is_success() {
            if status == reqwest::StatusCode::NOT_FOUND {
                return LookupResult::NotFound;
            }
            return classify_fault(&fault_text(status, &body));
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Object(map)) if map.is_empty() => LookupResult::NotFound,
            Ok(Value::Object(map)) => LookupResult::Found(flatten_strings(map)),
            Ok(Value::Null) => LookupResult::NotFound,
            Ok(other) => LookupResult::Fault(format!("unexpected {} response: {}", operation, other)),
            Err(e) => LookupResult::Fault(format!("malformed {} response: {}", operation, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve one request with a body cut short of its declared length.
    fn truncated_body_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.ends_with(b"\r\n\r\n{}") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let response = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{{\"fault",
                status_line
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base_url: String) -> HttpTargetClient {
        HttpTargetClient::new(&TargetConfig {
            base_url,
            timeout_secs: 5,
            ..TargetConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = HttpTargetClient::new(&TargetConfig {
            base_url: "https://hr.example.com/api/".to_string(),
            ..TargetConfig::default()
        })
        .unwrap();
        assert_eq!(client.base_url, "https://hr.example.com/api");
    }

    #[test]
    fn classifier_recognizes_not_found() {
        assert_eq!(
            classify_fault("Validation error occurred. Invalid ID value. 'S9' is not a valid ID"),
            LookupResult::NotFound
        );
        assert_eq!(
            classify_fault("Processing error occurred"),
            LookupResult::Fault("Processing error occurred".to_string())
        );
    }

    #[test]
    fn fault_text_prefers_faultstring() {
        let status = reqwest::StatusCode::INTERNAL_SERVER_ERROR;
        assert_eq!(
            fault_text(status, r#"{"faultstring": "Invalid ID value"}"#),
            "Invalid ID value"
        );
        assert_eq!(fault_text(status, ""), "HTTP 500 Internal Server Error");
        assert_eq!(fault_text(status, "oops"), "HTTP 500 Internal Server Error: oops");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let client = HttpTargetClient::new(&TargetConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..TargetConfig::default()
        })
        .unwrap();
        let result = client
            .send(Operation::PutLocation, &serde_json::json!({}))
            .await;
        assert!(matches!(result, SendResult::Unreachable(_)));
    }

    #[tokio::test]
    async fn unreadable_fault_body_is_transient() {
        let client = client_for(truncated_body_server("HTTP/1.1 500 Internal Server Error"));
        let result = client
            .send(Operation::PutLocation, &serde_json::json!({}))
            .await;
        assert!(matches!(result, SendResult::Unreachable(_)), "{:?}", result);
    }

    #[tokio::test]
    async fn unreadable_lookup_body_is_a_fault() {
        let client = client_for(truncated_body_server("HTTP/1.1 200 OK"));
        let result = client
            .lookup(Operation::GetLocations, &serde_json::json!({}))
            .await;
        assert!(matches!(result, LookupResult::Fault(_)), "{:?}", result);
    }
}
