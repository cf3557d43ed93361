use axum::body::{to_bytes, Body};
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use fleetota_lib::engine::api::{create_router, ApiState};
use fleetota_lib::engine::config::Config;
use fleetota_lib::engine::firmware::verify::content_hash;
use fleetota_lib::FleetContext;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "fleetota-test-boundary";

struct TestServer {
    _dir: TempDir,
    fleet: Arc<FleetContext>,
    router: Router,
}

fn server() -> TestServer {
    server_with(Config::default())
}

fn server_with(config: Config) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let fleet = Arc::new(FleetContext::in_memory(dir.path(), config).unwrap());
    let router = create_router(ApiState { fleet: fleet.clone() })
        .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 7], 40000))));
    TestServer {
        _dir: dir,
        fleet,
        router,
    }
}

async fn send(server: &TestServer, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = server.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

async fn get(server: &TestServer, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    send(server, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post_json(server: &TestServer, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _, bytes) = send(server, request).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn multipart_body(firmware: Option<&[u8]>, version: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(bytes) = firmware {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"firmware\"; filename=\"fw.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    if let Some(version) = version {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"version\"\r\n\r\n{version}\r\n")
                .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn publish(server: &TestServer, firmware: Option<&[u8]>, version: Option<&str>) -> (StatusCode, Value) {
    let request = Request::post("/api/firmware")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(firmware, version)))
        .unwrap();
    let (status, _, bytes) = send(server, request).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_poll_before_publish_reports_no_firmware() {
    let server = server();

    let (status, _, body) = get(&server, "/api/firmware/download?device_id=d1&version=0.9.0").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["message"], "No firmware available");

    let (status, _, _) = get(&server, "/api/firmware").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(server.fleet.registry.get("d1").unwrap().is_none());
}

#[tokio::test]
async fn test_publish_requires_firmware_file() {
    let server = server();

    let (status, body) = publish(&server, None, Some("1.0.0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No firmware file provided");

    let (status, _) = publish(&server, Some(b""), Some("1.0.0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(server.fleet.store.current().unwrap().is_none());
}

#[tokio::test]
async fn test_full_update_lifecycle() {
    let server = server();
    let b1: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();

    // Publish with an explicit version
    let (status, body) = publish(&server, Some(&b1), Some("1.0.0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "1.0.0");
    assert_eq!(body["content_hash"], content_hash(&b1));

    let (status, _, body) = get(&server, "/api/firmware").await;
    assert_eq!(status, StatusCode::OK);
    let current: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(current["version"], "1.0.0");
    assert_eq!(current["size"], b1.len() as u64);

    // Unknown device on an older version downloads the binary
    let (status, headers, bytes) = get(&server, "/api/firmware/download?device_id=d1&version=0.9.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b1);
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("firmware.bin"));
    assert_eq!(headers["x-firmware-version"], "1.0.0");
    assert_eq!(headers["x-firmware-hash"], content_hash(&b1).as_str());

    // Matching version is not modified, twice
    for _ in 0..2 {
        let (status, headers, bytes) =
            get(&server, "/api/firmware/download?device_id=d1&version=1.0.0").await;
        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert!(bytes.is_empty());
        assert_eq!(headers["x-firmware-version"], "1.0.0");
    }

    // Forced device downloads despite matching
    let (status, body) = post_json(&server, "/api/force-update", json!({ "device_id": "d1" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Update forced for device d1");

    let (status, _, bytes) = get(&server, "/api/firmware/download?device_id=d1&version=1.0.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b1);

    // Clearing restores the normal decision
    let (status, _) = post_json(&server, "/api/clear-update", json!({ "device_id": "d1" })).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = get(&server, "/api/firmware/download?device_id=d1&version=1.0.0").await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    // Default-versioned publish moves the fleet
    let b2 = b"second image".to_vec();
    let (status, body) = publish(&server, Some(&b2), None).await;
    assert_eq!(status, StatusCode::OK);
    let v2 = body["version"].as_str().unwrap().to_string();
    assert!(!v2.is_empty());
    assert_ne!(v2, "1.0.0");

    let (status, headers, bytes) = get(&server, "/api/firmware/download?device_id=d1&version=1.0.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b2);
    assert_eq!(headers["x-firmware-version"], v2.as_str());

    // Listing reflects the last check
    let (status, _, body) = get(&server, "/api/devices").await;
    assert_eq!(status, StatusCode::OK);
    let list: Value = serde_json::from_slice(&body).unwrap();
    let devices = list["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["device_id"], "d1");
    assert_eq!(devices[0]["current_version"], "1.0.0");
    assert_eq!(devices[0]["update_forced"], false);
    assert_eq!(devices[0]["last_update_check"].as_str().unwrap().len(), 19);
}

#[tokio::test]
async fn test_poll_without_version_always_downloads() {
    let server = server();
    publish(&server, Some(b"image"), Some("1.0.0")).await;

    let (status, _, bytes) = get(&server, "/api/firmware/download?device_id=d9").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"image");

    let (status, _, _) = get(&server, "/api/firmware/download").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_force_update_validation() {
    let server = server();

    let (status, body) = post_json(&server, "/api/force-update", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No device ID provided");

    let (status, _) = post_json(&server, "/api/force-update", json!({ "device_id": "" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &server,
        "/api/force-update",
        json!({ "device_id": "d1", "priority": "high" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(server.fleet.registry.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_force_before_first_contact_creates_device() {
    let server = server();

    let (status, _) = post_json(&server, "/api/force-update", json!({ "device_id": "new" })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = get(&server, "/api/devices/new").await;
    assert_eq!(status, StatusCode::OK);
    let device: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(device["update_forced"], true);
    assert!(device["last_seen"].is_null());
}

#[tokio::test]
async fn test_report_records_sighting() {
    let server = server();

    let (status, body) = post_json(
        &server,
        "/api/devices/report",
        json!({ "device_id": "sensor-1", "firmware_version": "0.9.0", "temperature": 21.5 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ip_address"], "10.0.0.7");
    assert_eq!(body["firmware_version"], "0.9.0");
    assert!(body["last_seen"].is_string());

    let record = server.fleet.registry.get("sensor-1").unwrap().unwrap();
    assert_eq!(record.reported_firmware_version.as_deref(), Some("0.9.0"));

    let (status, _) = post_json(&server, "/api/devices/report", json!({ "temperature": 3 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_device_lookup_is_not_found() {
    let server = server();
    let (status, _, body) = get(&server, "/api/devices/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Device not found: missing");
}

#[tokio::test]
async fn test_health_and_connection_checks() {
    let server = server();

    let (status, _, body) = get(&server, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["storage"], "reachable");
    assert!(health["firmware_version"].is_null());
    assert!(server.fleet.registry.list().unwrap().is_empty());

    let (status, _, body) = get(&server, "/api/test-connection").await;
    assert_eq!(status, StatusCode::OK);
    let conn: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(conn["client_ip"], "10.0.0.7");
    assert_eq!(conn["status"], "success");

    let (status, _, body) = get(&server, "/api/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    let doc: Value = serde_json::from_slice(&body).unwrap();
    assert!(doc["paths"]["/api/firmware/download"].is_object());
}

#[tokio::test]
async fn test_storage_timeout_is_a_server_error() {
    let mut config = Config::default();
    config.storage.timeout_ms = 0;
    config.server.max_upload_bytes = 64 * 1024 * 1024;
    let server = server_with(config);

    let firmware = vec![0x5A; 32 * 1024 * 1024];
    let (status, body) = publish(&server, Some(&firmware), Some("1.0.0")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("timed out"));
    assert!(server.fleet.store.current().unwrap().is_none());
}

#[tokio::test]
async fn test_failed_registry_write_is_a_server_error() {
    let server = server();
    publish(&server, Some(b"image"), Some("1.0.0")).await;

    server
        .fleet
        .database
        .get_connection()
        .unwrap()
        .execute("DROP TABLE devices", [])
        .unwrap();

    let (status, _, body) = get(&server, "/api/firmware/download?device_id=d1&version=0.9.0").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["error"].as_str().unwrap().contains("devices"));

    let (status, _, _) = get(&server, "/api/devices").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _) = post_json(&server, "/api/force-update", json!({ "device_id": "d1" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_unprefixed_device_paths() {
    let server = server();

    let request = Request::post("/upload-firmware")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(Some(b"field image"), Some("1.0.0"))))
        .unwrap();
    let (status, _, _) = send(&server, request).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, bytes) = get(&server, "/get-firmware?device_id=d1&version=0.9.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"field image");

    let (status, _, _) = get(&server, "/get-firmware?device_id=d1&version=1.0.0").await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    let (status, _) = post_json(&server, "/force-update", json!({ "device_id": "d1" })).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = get(&server, "/devices").await;
    assert_eq!(status, StatusCode::OK);
    let list: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(list["devices"][0]["update_forced"], true);

    let (status, _, _) = get(&server, "/ping-db").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = get(&server, "/test-connection").await;
    assert_eq!(status, StatusCode::OK);
}
