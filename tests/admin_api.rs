mod common;

use std::net::SocketAddr;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use fleet_forge::admin::{self, AppState};
use fleet_forge::compile::TargetFormat;
use fleet_forge::config::FleetConfig;
use fleet_forge::fleet::TransportError;
use fleet_forge::Shutdown;

use common::{agent, basic_model, test_config, Harness};

struct Server {
    addr: SocketAddr,
    harness: Harness,
    shutdown: Shutdown,
    client: reqwest::Client,
}

impl Server {
    async fn start(config: FleetConfig) -> Self {
        let mut model = basic_model();
        model.agents.push(agent("a1", &[TargetFormat::RoutingEngine]));
        model.agents.push(agent("a2", &[TargetFormat::DnsRouter]));
        let harness = Harness::with_config(model, config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let state = AppState::new(&harness.services);
        let stop = shutdown.clone();
        tokio::spawn(async move { admin::serve(listener, state, &stop).await });

        Self {
            addr,
            harness,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth("test-key")
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth("test-key")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

#[tokio::test]
async fn test_api_key_required() {
    let server = Server::start(test_config()).await;

    let res = server.client.get(server.url("/api/status")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let res = server
        .client
        .get(server.url("/api/status"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let status: Value = server.get("/api/status").send().await.unwrap().json().await.unwrap();
    assert_eq!(status["status"], "operational");
    assert_eq!(status["agents"], 2);
}

#[tokio::test]
async fn test_agent_listing_hides_tokens() {
    let server = Server::start(test_config()).await;
    let text = server.get("/api/agents").send().await.unwrap().text().await.unwrap();
    assert!(text.contains("\"id\":\"a1\""));
    assert!(!text.contains("token-a1"));
}

#[tokio::test]
async fn test_fleet_push_over_http() {
    let server = Server::start(test_config()).await;
    server
        .harness
        .transport
        .fail_always("a2", TransportError::Remote {
            status: 503,
            message: "busy".into(),
        });

    let body: Value = server
        .post("/api/fleet/push")
        .json(&json!({ "formats": [] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["succeeded"], 1);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["agents"]["a1"]["status"], "ok");
    assert_eq!(body["agents"]["a1"]["report"]["formats"][0]["outcome"], "pushed");
    assert_eq!(body["agents"]["a2"]["status"], "failed");
    assert_eq!(body["agents"]["a2"]["transient"], true);
    assert_eq!(body["agents"]["a2"]["attempts"].as_array().unwrap().len(), 3);
    assert_eq!(body["agents"]["a2"]["formats"], json!([]));

    let res = server
        .post("/api/agents/a1/push")
        .json(&json!({ "formats": ["routing-engine"] }))
        .send()
        .await
        .unwrap();
    let report: Value = res.json().await.unwrap();
    assert_eq!(report["formats"][0]["outcome"], "skipped");
}

#[tokio::test]
async fn test_error_statuses() {
    let server = Server::start(test_config()).await;

    let res = server.post("/api/agents/ghost/restart").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = server
        .get("/api/agents/a1/logs")
        .query(&[("path", "/etc/shadow")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["success"], false);

    let res = server.get("/api/artifacts/wireguard").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_artifact_preview_and_overlay() {
    let server = Server::start(test_config()).await;

    let res = server
        .client
        .put(server.url("/api/overlays/mihomo"))
        .bearer_auth("test-key")
        .body("sniffer:\n  enable: true\n")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let artifact: Value = server.get("/api/artifacts/routing-engine").send().await.unwrap().json().await.unwrap();
    assert_eq!(artifact["format"], "routing-engine");
    assert_eq!(artifact["hash"].as_str().unwrap().len(), 64);
    assert!(artifact["content"].as_str().unwrap().ends_with("sniffer:\n  enable: true\n"));
}

#[tokio::test]
async fn test_config_endpoint_requires_token() {
    let server = Server::start(test_config()).await;
    let res = server
        .client
        .get(server.url("/api/config/routing-engine?token=x"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let mut config = test_config();
    config.admin.config_token = Some("pull-token".into());
    let server = Server::start(config).await;

    let res = server
        .client
        .get(server.url("/api/config/dns-router?token=wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server
        .client
        .get(server.url("/api/config/dns-router?token=pull-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-config-hash"));
    assert!(res.text().await.unwrap().contains("main_sequence"));
}

#[tokio::test]
async fn test_registration_and_install_params() {
    let mut config = test_config();
    config.admin.registration_token = Some("join".into());
    config.admin.public_url = "https://cp.example.com".into();
    let server = Server::start(config).await;

    let registration = json!({
        "name": "edge-7",
        "host": "172.18.0.3",
        "port": 9090,
        "formats": ["routing-engine"],
    });
    let res = server
        .client
        .post(server.url("/api/agents/register"))
        .json(&registration)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let registered: Value = server
        .client
        .post(server.url("/api/agents/register"))
        .bearer_auth("join")
        .json(&registration)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(registered["created"], true);
    let id = registered["id"].as_str().unwrap().to_string();

    // The bridge address is replaced by the connection's peer address.
    let snapshot = server.harness.store().snapshot();
    assert_eq!(snapshot.agent(&id).unwrap().host, "127.0.0.1");

    let params: Value = server
        .get(&format!("/api/agents/{}/install", id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(params["register_url"], "https://cp.example.com/api/agents/register");
    assert_eq!(params["register_token"], "join");
    assert_eq!(params["service_type"], "mihomo");

    let env = server
        .get("/api/install")
        .query(&[("name", "new"), ("format", "mosdns"), ("output", "env")])
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(env.contains("SERVICE_TYPE='mosdns'\n"));
    assert!(env.contains("CONFIG_PATH='/etc/mosdns/config.yaml'\n"));
}

async fn register_behind(server: &Server, name: &str, forwarded_for: &str) -> String {
    let registered: Value = server
        .post("/api/agents/register")
        .header("x-forwarded-for", forwarded_for)
        .json(&json!({ "name": name, "host": "0.0.0.0", "port": 9090, "formats": ["routing-engine"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = registered["id"].as_str().unwrap().to_string();
    server.harness.store().snapshot().agent(&id).unwrap().host.clone()
}

#[tokio::test]
async fn test_forwarded_for_needs_trusted_proxy() {
    let server = Server::start(test_config()).await;
    assert_eq!(register_behind(&server, "direct", "203.0.113.9").await, "127.0.0.1");

    let mut config = test_config();
    config.admin.trusted_proxies = vec!["127.0.0.1".parse().unwrap()];
    let proxied = Server::start(config).await;
    assert_eq!(register_behind(&proxied, "proxied", "203.0.113.9").await, "203.0.113.9");
}

#[tokio::test]
async fn test_model_export_import_and_reset() {
    let server = Server::start(test_config()).await;

    let exported: Value = server.get("/api/model").send().await.unwrap().json().await.unwrap();
    assert_eq!(exported["agents"][0]["token"], "token-a1");
    let redacted: Value = server
        .get("/api/model?redact=true")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(redacted["agents"][0]["token"], "***");

    let res = server
        .client
        .put(server.url("/api/model"))
        .bearer_auth("test-key")
        .json(&redacted)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let before = server.harness.store().version();
    let mut trimmed = exported.clone();
    trimmed["agents"] = json!([]);
    let written: Value = server
        .client
        .put(server.url("/api/model"))
        .bearer_auth("test-key")
        .json(&trimmed)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(written["model_version"], before + 1);
    let snapshot = server.harness.store().snapshot();
    assert!(snapshot.agents.is_empty());
    assert_eq!(snapshot.nodes.len(), 2);

    let res = server.post("/api/model/reset").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(server.harness.store().snapshot().nodes.is_empty());
}

#[tokio::test]
async fn test_aggregation_lifecycle() {
    let server = Server::start(test_config()).await;
    let put = |body: Value| {
        server
            .client
            .put(server.url("/api/aggregations/jp"))
            .bearer_auth("test-key")
            .json(&body)
            .send()
    };

    let res = put(json!({ "id": "ignored", "name": "Japan", "nodes": ["n1", "n2"], "regex_filter": "(" }))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = put(json!({ "id": "ignored", "name": "Japan", "nodes": ["n1", "n2"], "regex_filter": "^Tok" }))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(server.harness.store().snapshot().aggregation("jp").is_some());

    let preview: Value = server
        .get("/api/aggregations/jp/preview")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(preview["count"], 1);
    assert_eq!(preview["nodes"][0]["name"], "Tokyo");
    assert_eq!(preview["nodes"][0]["protocol"], "ss");

    let res = server
        .client
        .delete(server.url("/api/aggregations/jp"))
        .bearer_auth("test-key")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = server.get("/api/aggregations/jp/preview").send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}
