//! FleetOTA API Module
//! REST endpoints for devices (poll, report) and operators (publish, force, list)

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::engine::error::{FleetError, StorageError};
use crate::engine::firmware::{FirmwareDownload, FirmwareImage};
use crate::engine::registry::DeviceView;
use crate::engine::updates::{PollOutcome, PollRequest};
use crate::FleetContext;

static X_FIRMWARE_VERSION: HeaderName = HeaderName::from_static("x-firmware-version");
static X_FIRMWARE_HASH: HeaderName = HeaderName::from_static("x-firmware-hash");

#[derive(Clone)]
pub struct ApiState {
    pub fleet: Arc<FleetContext>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        current_firmware,
        download_firmware,
        publish_firmware,
        force_update,
        clear_forced_update,
        list_devices,
        get_device,
        report_device,
    ),
    components(schemas(
        FirmwareImage,
        DeviceView,
        PublishForm,
        PublishResponse,
        DeviceIdRequest,
        DeviceReport,
        DeviceList,
        MessageResponse,
    )),
    tags(
        (name = "firmware", description = "Firmware publishing and download"),
        (name = "devices", description = "Device fleet registry"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let server = &state.fleet.config.server;
    let upload_limit = DefaultBodyLimit::max(server.max_upload_bytes);
    let timeout =
        TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, server.request_timeout());

    Router::new()
        .route(
            "/api/firmware",
            get(current_firmware).post(publish_firmware).layer(upload_limit),
        )
        .route("/api/firmware/download", get(download_firmware))
        .route("/api/force-update", post(force_update))
        .route("/api/clear-update", post(clear_forced_update))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/report", post(report_device))
        .route("/api/devices/{device_id}", get(get_device))
        .route("/api/health", get(health_check))
        .route("/api/test-connection", get(test_connection))
        .route("/api/openapi.json", get(openapi_document))
        // Unprefixed paths used by devices and scripts already in the field
        .route("/get-firmware", get(download_firmware))
        .route(
            "/upload-firmware",
            post(publish_firmware).layer(upload_limit),
        )
        .route("/force-update", post(force_update))
        .route("/devices", get(list_devices))
        .route("/ping-db", get(health_check))
        .route("/test-connection", get(test_connection))
        .layer(cors)
        .layer(timeout)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl-C
pub async fn serve(state: ApiState, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "FleetOTA API listening");

    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ========== Errors ==========

#[derive(Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self(FleetError::Storage(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::NotPublished | FleetError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Storage(_) | FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn validation(message: impl Into<String>) -> ApiError {
    ApiError(FleetError::Validation(message.into()))
}

/// Run a synchronous registry call off the async workers
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(f).await.map_err(FleetError::from)?;
    Ok(result?)
}

// ========== Firmware ==========

#[utoipa::path(
    get,
    path = "/api/firmware",
    responses(
        (status = 200, description = "Published firmware metadata", body = FirmwareImage),
        (status = 404, description = "No firmware published yet")
    ),
    tag = "firmware"
)]
async fn current_firmware(State(state): State<ApiState>) -> Result<Json<FirmwareImage>, ApiError> {
    state
        .fleet
        .store
        .current()?
        .map(Json)
        .ok_or(ApiError(FleetError::NotPublished))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PollParams {
    /// Polling device
    device_id: Option<String>,
    /// Version the device currently runs
    version: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/firmware/download",
    params(PollParams),
    responses(
        (status = 200, description = "Firmware binary (application/octet-stream, firmware.bin)"),
        (status = 304, description = "Firmware up to date"),
        (status = 404, description = "No firmware available", body = MessageResponse)
    ),
    tag = "firmware"
)]
async fn download_firmware(
    State(state): State<ApiState>,
    Query(params): Query<PollParams>,
) -> Result<Response, ApiError> {
    let request = PollRequest::new(params.device_id.as_deref(), params.version.as_deref());

    let response = match state.fleet.updates.poll(request).await? {
        PollOutcome::NoFirmwareAvailable => (
            StatusCode::NOT_FOUND,
            Json(MessageResponse {
                message: "No firmware available".to_string(),
            }),
        )
            .into_response(),
        PollOutcome::UpToDate { version } => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&version) {
                headers.insert(X_FIRMWARE_VERSION.clone(), value);
            }
            (StatusCode::NOT_MODIFIED, headers).into_response()
        }
        PollOutcome::UpdateAvailable(download) => firmware_response(download),
    };
    Ok(response)
}

fn firmware_response(download: FirmwareDownload) -> Response {
    let image = &download.image;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=\"firmware.bin\""),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(image.size));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", image.content_hash)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&image.content_hash) {
        headers.insert(X_FIRMWARE_HASH.clone(), value);
    }
    // Operator-supplied versions may not be valid header text
    if let Ok(value) = HeaderValue::from_str(&image.version) {
        headers.insert(X_FIRMWARE_VERSION.clone(), value);
    }

    (StatusCode::OK, headers, Body::from_stream(download.into_stream())).into_response()
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct PublishForm {
    /// Firmware binary
    #[schema(value_type = String, format = Binary)]
    firmware: Vec<u8>,
    /// Version label; defaults to the publish timestamp
    version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PublishResponse {
    pub message: String,
    pub version: String,
    pub content_hash: String,
    pub size: u64,
}

#[utoipa::path(
    post,
    path = "/api/firmware",
    request_body(content = PublishForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Firmware published", body = PublishResponse),
        (status = 400, description = "No firmware file provided")
    ),
    tag = "firmware"
)]
async fn publish_firmware(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<PublishResponse>, ApiError> {
    let mut payload = None;
    let mut version = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| validation(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("firmware") => {
                let bytes = field.bytes().await.map_err(|e| validation(e.body_text()))?;
                payload = Some(bytes.to_vec());
            }
            Some("version") => {
                version = Some(field.text().await.map_err(|e| validation(e.body_text()))?);
            }
            other => debug!(field = ?other, "Ignoring unrecognized upload field"),
        }
    }

    let payload = payload.ok_or_else(|| validation("No firmware file provided"))?;
    let image = state
        .fleet
        .admin
        .publish_firmware(payload, version.as_deref())
        .await?;

    Ok(Json(PublishResponse {
        message: "Firmware uploaded successfully".to_string(),
        version: image.version,
        content_hash: image.content_hash,
        size: image.size,
    }))
}

// ========== Devices ==========

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct DeviceIdRequest {
    pub device_id: Option<String>,
}

fn device_id_body(body: Result<Json<DeviceIdRequest>, JsonRejection>) -> Result<Option<String>, ApiError> {
    match body {
        Ok(Json(req)) => Ok(req.device_id),
        Err(rejection) => Err(validation(rejection.body_text())),
    }
}

#[utoipa::path(
    post,
    path = "/api/force-update",
    request_body = DeviceIdRequest,
    responses(
        (status = 200, description = "Update forced", body = MessageResponse),
        (status = 400, description = "No device ID provided")
    ),
    tag = "devices"
)]
async fn force_update(
    State(state): State<ApiState>,
    body: Result<Json<DeviceIdRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let device_id = device_id_body(body)?;
    let record = state.fleet.admin.force_update(device_id.as_deref()).await?;
    Ok(Json(MessageResponse {
        message: format!("Update forced for device {}", record.device_id),
    }))
}

#[utoipa::path(
    post,
    path = "/api/clear-update",
    request_body = DeviceIdRequest,
    responses(
        (status = 200, description = "Forced update cleared", body = MessageResponse),
        (status = 400, description = "No device ID provided")
    ),
    tag = "devices"
)]
async fn clear_forced_update(
    State(state): State<ApiState>,
    body: Result<Json<DeviceIdRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let device_id = device_id_body(body)?;
    let record = state
        .fleet
        .admin
        .clear_forced_update(device_id.as_deref())
        .await?;
    Ok(Json(MessageResponse {
        message: format!("Forced update cleared for device {}", record.device_id),
    }))
}

#[derive(Serialize, ToSchema)]
pub struct DeviceList {
    pub devices: Vec<DeviceView>,
}

#[utoipa::path(
    get,
    path = "/api/devices",
    responses(
        (status = 200, description = "All known devices", body = DeviceList)
    ),
    tag = "devices"
)]
async fn list_devices(State(state): State<ApiState>) -> Result<Json<DeviceList>, ApiError> {
    let registry = state.fleet.registry.clone();
    let records = blocking(move || registry.list()).await?;
    let format = &state.fleet.config.display.timestamp_format;
    Ok(Json(DeviceList {
        devices: records.iter().map(|r| DeviceView::new(r, format)).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/devices/{device_id}",
    params(
        ("device_id" = String, Path, description = "Device identifier"),
    ),
    responses(
        (status = 200, description = "Device record", body = DeviceView),
        (status = 404, description = "Unknown device")
    ),
    tag = "devices"
)]
async fn get_device(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceView>, ApiError> {
    let registry = state.fleet.registry.clone();
    let id = device_id.clone();
    let record = blocking(move || registry.get(&id))
        .await?
        .ok_or(ApiError(FleetError::DeviceNotFound(device_id)))?;
    Ok(Json(DeviceView::new(
        &record,
        &state.fleet.config.display.timestamp_format,
    )))
}

/// Sighting from the telemetry path. Sensor fields riding along in the same
/// payload are ignored here; storing readings is not this service's job.
#[derive(Debug, Deserialize, ToSchema)]
pub struct DeviceReport {
    pub device_id: Option<String>,
    pub firmware_version: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/devices/report",
    request_body = DeviceReport,
    responses(
        (status = 200, description = "Device recorded", body = DeviceView),
        (status = 400, description = "No device ID provided")
    ),
    tag = "devices"
)]
async fn report_device(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Result<Json<DeviceReport>, JsonRejection>,
) -> Result<Json<DeviceView>, ApiError> {
    let Json(report) = body.map_err(|e| validation(e.body_text()))?;
    let device_id = report
        .device_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| validation("No device ID provided"))?;

    let registry = state.fleet.registry.clone();
    let ip = peer.ip().to_string();
    let version = report.firmware_version;
    let record = blocking(move || {
        registry.record_telemetry(&device_id, version.as_deref(), Some(ip.as_str()))
    })
    .await?;

    Ok(Json(DeviceView::new(
        &record,
        &state.fleet.config.display.timestamp_format,
    )))
}

// ========== Probes ==========

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub storage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub firmware_version: Option<String>,
}

/// Storage reachability probe; never mutates state
async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let registry = state.fleet.registry.clone();
    let check = match blocking(move || registry.ping()).await {
        Ok(()) => state.fleet.store.current().map_err(ApiError::from),
        Err(e) => Err(e),
    };

    let (status, storage, message, firmware_version) = match check {
        Ok(image) => (StatusCode::OK, "reachable", None, image.map(|i| i.version)),
        Err(ApiError(e)) => {
            warn!(error = %e, "Storage health check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "unreachable",
                Some(e.to_string()),
                None,
            )
        }
    };

    (
        status,
        Json(HealthResponse {
            status: if status.is_success() { "ok" } else { "error" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            storage: storage.to_string(),
            message,
            firmware_version,
        }),
    )
}

#[derive(Serialize)]
pub struct ConnectionResponse {
    pub status: String,
    pub message: String,
    pub client_ip: String,
    pub server_time: String,
}

/// Lets a device confirm it can reach the server
async fn test_connection(
    State(state): State<ApiState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Json<ConnectionResponse> {
    Json(ConnectionResponse {
        status: "success".to_string(),
        message: "Connection successful".to_string(),
        client_ip: peer.ip().to_string(),
        server_time: Local::now()
            .format(&state.fleet.config.display.timestamp_format)
            .to_string(),
    })
}

async fn openapi_document() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
