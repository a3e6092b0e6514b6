//! Integration test common infrastructure.
//!
//! Provides utilities for spawning towerd instances and driving the
//! HTTP API.

pub mod server;

#[allow(unused_imports)]
pub use server::{ADMIN_TOKEN, TestServer};

/// Log one request event for `ip` and return the response status and
/// decision body.
#[allow(dead_code)]
pub async fn log_ip(
    client: &reqwest::Client,
    server: &TestServer,
    ip: &str,
) -> (reqwest::StatusCode, serde_json::Value) {
    let response = client
        .post(server.url("/api/v1/log"))
        .json(&serde_json::json!({ "ip": ip, "method": "GET", "path": "/test" }))
        .send()
        .await
        .expect("log request");
    let status = response.status();
    let body = response.json().await.expect("decision json");
    (status, body)
}

/// Inspect `ip` and return the response status and decision body.
#[allow(dead_code)]
pub async fn inspect_ip(
    client: &reqwest::Client,
    server: &TestServer,
    ip: &str,
) -> (reqwest::StatusCode, serde_json::Value) {
    let response = client
        .get(server.url("/api/v1/inspect"))
        .query(&[("ip", ip)])
        .send()
        .await
        .expect("inspect request");
    let status = response.status();
    let body = response.json().await.expect("decision json");
    (status, body)
}
