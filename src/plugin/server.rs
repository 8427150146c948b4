//! Plugin HTTP server
//!
//! Serves the Docker plugin protocol with axum on a Unix socket. Driver calls
//! touch hardware synchronously, so they run on the blocking pool.

use crate::error::{Error, Result};
use crate::plugin::protocol::{
    self, ActivateResponse, CapabilitiesResponse, CreateEndpointRequest, CreateEndpointResponse,
    CreateNetworkRequest, Empty, EndpointRef, ErrorResponse, InfoResponse, JoinResponse,
    NetworkRequest,
};
use crate::sriov::SriovDriver;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

/// State shared across handlers
#[derive(Clone)]
pub struct PluginState {
    pub driver: Arc<SriovDriver>,
}

impl PluginState {
    pub fn new(driver: Arc<SriovDriver>) -> Self {
        Self { driver }
    }
}

/// JSON answer with the plugin content type
pub struct PluginJson<T>(pub T);

impl<T: Serialize> IntoResponse for PluginJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, protocol::CONTENT_TYPE)], body).into_response(),
            Err(e) => ApiError(Error::Json(e)).into_response(),
        }
    }
}

/// Error answered as `{"Err": ...}` with status 500
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            err: self.0.to_string(),
        };
        let body = serde_json::to_vec(&body).unwrap_or_else(|_| b"{\"Err\":\"internal error\"}".to_vec());
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, protocol::CONTENT_TYPE)],
            body,
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<PluginJson<T>, ApiError>;

/// Build the plugin router
pub fn router(state: PluginState) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.AllocateNetwork", post(acknowledge))
        .route("/NetworkDriver.FreeNetwork", post(acknowledge))
        .route("/NetworkDriver.DiscoverNew", post(acknowledge))
        .route("/NetworkDriver.DiscoverDelete", post(acknowledge))
        .route("/NetworkDriver.ProgramExternalConnectivity", post(acknowledge))
        .route("/NetworkDriver.RevokeExternalConnectivity", post(acknowledge))
        .with_state(state)
}

/// Serve the plugin on `socket_path` until `shutdown` resolves
///
/// A stale socket from a previous run is replaced; the socket file is removed
/// again on exit.
pub async fn serve<F>(socket_path: &Path, driver: Arc<SriovDriver>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => debug!(socket = %socket_path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(socket_path)?;
    tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660)).await?;
    info!(socket = %socket_path.display(), backend = driver.backend(), "Plugin listening");

    let result = axum::serve(listener, router(PluginState::new(driver.clone())))
        .with_graceful_shutdown(shutdown)
        .await;

    if let Err(e) = tokio::fs::remove_file(socket_path).await {
        warn!(socket = %socket_path.display(), error = %e, "Failed to remove socket");
    }
    for pf in driver.device_status() {
        warn!(pf = %pf.name, refs = pf.ref_count, free_vfs = pf.free_vfs, "PF left enabled on exit");
    }
    info!(networks = driver.network_count(), "Plugin stopped");
    result.map_err(Error::from)
}

/// Run a driver call on the blocking pool
async fn blocking<T, F>(driver: &Arc<SriovDriver>, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SriovDriver) -> Result<T> + Send + 'static,
{
    let driver = Arc::clone(driver);
    tokio::task::spawn_blocking(move || call(&driver))
        .await
        .map_err(|e| Error::Protocol(format!("driver task failed: {}", e)))?
}

async fn activate() -> ApiResult<ActivateResponse> {
    debug!("Plugin activated");
    Ok(PluginJson(ActivateResponse::network_driver()))
}

async fn capabilities() -> ApiResult<CapabilitiesResponse> {
    Ok(PluginJson(CapabilitiesResponse::default()))
}

async fn acknowledge() -> ApiResult<Empty> {
    Ok(PluginJson(Empty {}))
}

async fn create_network(State(state): State<PluginState>, body: Bytes) -> ApiResult<Empty> {
    let req: CreateNetworkRequest = protocol::decode(&body)?;
    let options = req.network_options();
    let gateway = req.gateway()?;
    debug!(network = %req.network_id, ?options, ?gateway, "CreateNetwork");

    blocking(&state.driver, move |d| {
        d.create_network(&req.network_id, &options, gateway.as_deref())
    })
    .await?;
    Ok(PluginJson(Empty {}))
}

async fn delete_network(State(state): State<PluginState>, body: Bytes) -> ApiResult<Empty> {
    let req: NetworkRequest = protocol::decode(&body)?;
    debug!(network = %req.network_id, "DeleteNetwork");

    blocking(&state.driver, move |d| d.delete_network(&req.network_id)).await?;
    Ok(PluginJson(Empty {}))
}

async fn create_endpoint(
    State(state): State<PluginState>,
    body: Bytes,
) -> ApiResult<CreateEndpointResponse> {
    let req: CreateEndpointRequest = protocol::decode(&body)?;
    let request = req.endpoint_request()?;
    debug!(network = %req.network_id, endpoint = %req.endpoint_id, ?request, "CreateEndpoint");

    let iface = blocking(&state.driver, move |d| {
        d.create_endpoint(&req.network_id, &req.endpoint_id, &request)
    })
    .await?;
    Ok(PluginJson(iface.into()))
}

async fn delete_endpoint(State(state): State<PluginState>, body: Bytes) -> ApiResult<Empty> {
    let req: EndpointRef = protocol::decode(&body)?;
    debug!(network = %req.network_id, endpoint = %req.endpoint_id, "DeleteEndpoint");

    blocking(&state.driver, move |d| {
        d.delete_endpoint(&req.network_id, &req.endpoint_id)
    })
    .await?;
    Ok(PluginJson(Empty {}))
}

async fn endpoint_info(State(state): State<PluginState>, body: Bytes) -> ApiResult<InfoResponse> {
    let req: EndpointRef = protocol::decode(&body)?;
    let info = blocking(&state.driver, move |d| {
        d.endpoint_info(&req.network_id, &req.endpoint_id)
    })
    .await?;
    Ok(PluginJson(info.into()))
}

async fn join(State(state): State<PluginState>, body: Bytes) -> ApiResult<JoinResponse> {
    let req: EndpointRef = protocol::decode(&body)?;
    debug!(network = %req.network_id, endpoint = %req.endpoint_id, "Join");

    let info = blocking(&state.driver, move |d| d.join(&req.network_id, &req.endpoint_id)).await?;
    Ok(PluginJson(info.into()))
}

async fn leave(State(state): State<PluginState>, body: Bytes) -> ApiResult<Empty> {
    let req: EndpointRef = protocol::decode(&body)?;
    debug!(network = %req.network_id, endpoint = %req.endpoint_id, "Leave");

    blocking(&state.driver, move |d| d.leave(&req.network_id, &req.endpoint_id)).await?;
    Ok(PluginJson(Empty {}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::SimulatedSriov;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn state() -> PluginState {
        let hw = Arc::new(SimulatedSriov::new().with_pf("eth10", 2));
        PluginState::new(Arc::new(SriovDriver::new(hw)))
    }

    async fn body_json(resp: Response) -> (StatusCode, Value) {
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn network_body(id: &str, vlan: u16) -> Bytes {
        Bytes::from(
            json!({
                "NetworkID": id,
                "Options": {"com.docker.network.generic": {"netdevice": "eth10", "vlan": vlan.to_string()}},
                "IPv4Data": [{"Pool": "10.5.0.0/24", "Gateway": format!("10.5.{}.1/24", vlan % 256)}]
            })
            .to_string(),
        )
    }

    fn endpoint_body(nid: &str, eid: &str) -> Bytes {
        Bytes::from(json!({"NetworkID": nid, "EndpointID": eid}).to_string())
    }

    #[tokio::test]
    async fn test_activate_and_capabilities() {
        let (status, body) = body_json(activate().await.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"Implements": ["NetworkDriver"]}));

        let (_, body) = body_json(capabilities().await.into_response()).await;
        assert_eq!(body["Scope"], "local");
    }

    #[tokio::test]
    async fn test_network_and_endpoint_lifecycle() {
        let state = state();

        let resp = create_network(State(state.clone()), network_body("n1", 100)).await;
        let (status, body) = body_json(resp.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));

        let resp = create_endpoint(State(state.clone()), endpoint_body("n1", "e1")).await;
        let (status, body) = body_json(resp.into_response()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"Interface": {}}));

        let resp = join(State(state.clone()), endpoint_body("n1", "e1")).await;
        let (_, body) = body_json(resp.into_response()).await;
        assert_eq!(body["InterfaceName"]["SrcName"], "eth10v0");
        assert_eq!(body["InterfaceName"]["DstPrefix"], "eth");
        assert_eq!(body["Gateway"], "10.5.100.1");

        let resp = endpoint_info(State(state.clone()), endpoint_body("n1", "e1")).await;
        let (_, body) = body_json(resp.into_response()).await;
        assert_eq!(body["Value"]["vlan"], "100");
        assert_eq!(body["Value"]["pf"], "eth10");

        let resp = leave(State(state.clone()), endpoint_body("n1", "e1")).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let resp = delete_endpoint(State(state.clone()), endpoint_body("n1", "e1")).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);

        let body = Bytes::from(json!({"NetworkID": "n1"}).to_string());
        let resp = delete_network(State(state.clone()), body).await;
        assert_eq!(resp.into_response().status(), StatusCode::OK);
        assert_eq!(state.driver.network_count(), 0);
    }

    #[tokio::test]
    async fn test_driver_error_maps_to_err_body() {
        let state = state();
        create_network(State(state.clone()), network_body("n1", 100))
            .await
            .map_err(|e| e.0)
            .unwrap();

        let resp = create_network(State(state.clone()), network_body("n2", 100)).await;
        let (status, body) = body_json(resp.into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["Err"].as_str().unwrap().contains("100"));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let resp = delete_network(State(state()), Bytes::from_static(b"{")).await;
        let (status, body) = body_json(resp.into_response()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["Err"].is_string());
    }

    #[tokio::test]
    async fn test_serve_on_unix_socket() {
        let dir = std::env::temp_dir().join(format!("sriov_plugin_sock_{}", std::process::id()));
        let socket = dir.join("sriov.sock");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn({
            let socket = socket.clone();
            let driver = state().driver;
            async move {
                serve(&socket, driver, async {
                    let _ = rx.await;
                })
                .await
            }
        });

        let mut stream = None;
        for _ in 0..100 {
            if let Ok(s) = tokio::net::UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let mut stream = stream.expect("plugin socket never came up");
        let mode = tokio::fs::metadata(&socket).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        stream
            .write_all(b"POST /Plugin.Activate HTTP/1.1\r\nHost: plugin\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("NetworkDriver"));

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
