#![allow(dead_code)]

use client_guard::GuardConfig;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const API_KEY: &str = "test-key";
pub const PROJECT: &str = "acme-site";
pub const HEADING: &str = "Payment overdue";
pub const MESSAGE: &str = "This site is paused until the invoice is settled.";

pub fn config_for(server: &MockServer) -> GuardConfig {
    GuardConfig::new(API_KEY, PROJECT, HEADING, MESSAGE).with_api_url(format!("{}/api", server.uri()))
}

/// Answer authenticated opacity requests with `opacity`
pub async fn mount_opacity(server: &MockServer, opacity: f64) {
    Mock::given(method("GET"))
        .and(path("/api/opacity"))
        .and(header("Authorization", format!("Bearer {}", API_KEY).as_str()))
        .and(header("X-Project-Slug", PROJECT))
        .and(header("Accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "opacity": opacity })))
        .mount(server)
        .await;
}

pub async fn mount_response(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/api/opacity"))
        .respond_with(response)
        .mount(server)
        .await;
}

pub async fn status_server(opacity: f64) -> MockServer {
    let server = MockServer::start().await;
    mount_opacity(&server, opacity).await;
    server
}

/// Poll `cond` for up to ~3 seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
