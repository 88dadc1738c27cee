//! Integration tests for the inventory client

use std::time::Duration;

use serde_json::json;
use vm_agent::inventory::InventoryClient;
use vm_agent::roles::select_role;
use vm_agent::{AgentError, Role};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, hostname: &str) -> InventoryClient {
    InventoryClient::new(&server.uri(), hostname, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_vm_details_fetched_by_hostname() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/state/vm/dns-01"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "vm_id": "101",
            "name": "dns-01",
            "node_name": "pve-1",
            "tags": ["prod", "dns"],
            "ip_config": [{"ip_address": "10.1.0.53/24", "gateway": "10.1.0.1", "order": 0}],
            "disk": [{"id": 1, "order": 1, "size": "1G", "bus_type": "scsi", "import_from": "dns-config.img"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let vm = client(&server, "dns-01").vm_details().await.unwrap();

    assert_eq!(vm.name, "dns-01");
    assert_eq!(vm.ip_config[0].ip_address, "10.1.0.53/24");
    assert_eq!(vm.disk[0].import_from, "dns-config.img");
    assert_eq!(select_role(&vm.tags), Some(Role::Dns));
}

#[tokio::test]
async fn test_tags_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/state/vm/k8s-worker-03/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["k8s-worker", "prod"])))
        .mount(&server)
        .await;

    let tags = client(&server, "k8s-worker-03").tags().await.unwrap();
    assert_eq!(select_role(&tags), Some(Role::KubernetesWorker));
}

#[tokio::test]
async fn test_unknown_host_is_http_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/state/vm/ghost"))
        .respond_with(ResponseTemplate::new(404).set_body_string("vm not found"))
        .mount(&server)
        .await;

    match client(&server, "ghost").vm_details().await {
        Err(AgentError::HttpStatus { status, body, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "vm not found");
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_record_is_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/state/vm/dns-01"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let result = client(&server, "dns-01").vm_details().await;
    assert!(matches!(result, Err(AgentError::Http(_))));
}
