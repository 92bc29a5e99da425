//! Integration tests for `/health`, `/status` and `DELETE /cache`.

mod common;

use common::{encoded, test_config, TestHarness};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn health_reports_cache_stats() {
    let (_h, addr) = TestHarness::with_server().await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["caches"]["manifest"]["size"], 0);
    assert_eq!(body["caches"]["manifest"]["max_size"], 200);
    assert_eq!(body["caches"]["requests"]["max_size"], 1000);
}

#[tokio::test]
async fn status_reports_mode_sessions_and_endpoints() {
    let (_h, addr) = TestHarness::with_server().await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "vodrelay");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["media_mode"], "memory");
    assert_eq!(body["sessions"].as_array().unwrap().len(), 0);
    assert!(body["endpoints"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e.as_str().unwrap().contains("/proxy")));
}

#[tokio::test]
async fn status_requires_auth_when_enabled() {
    let mut config = test_config();
    config.server.auth.enabled = true;
    config.server.auth.token = Some("s3cret".into());
    let (_h, addr) = TestHarness::with_server_config(config).await;

    let resp = reqwest::get(format!("http://{addr}/status")).await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/status"))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Health stays open for load balancers.
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn cache_clear_is_forbidden_by_default() {
    let (_h, addr) = TestHarness::with_server().await;

    let resp = reqwest::Client::new()
        .delete(format!("http://{addr}/cache"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn cache_clear_empties_both_caches() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\nseg.ts\n"))
        .expect(2)
        .mount(&origin)
        .await;

    let mut config = test_config();
    config.server.allow_cache_clear = true;
    let (h, addr) = TestHarness::with_server_config(config).await;
    let proxy_url = format!(
        "http://{addr}/proxy?url={}",
        encoded(&format!("{}/index.m3u8", origin.uri()))
    );

    reqwest::get(&proxy_url).await.unwrap().text().await.unwrap();
    assert_eq!(h.ctx.manifest_cache.size(), 1);

    let resp = reqwest::Client::new()
        .delete(format!("http://{addr}/cache"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["cleared"], true);
    assert_eq!(body["manifest"], 1);
    assert_eq!(h.ctx.manifest_cache.size(), 0);
    assert_eq!(h.ctx.request_cache.size(), 0);

    // The next request goes back to the origin.
    reqwest::get(&proxy_url).await.unwrap().text().await.unwrap();
}
