//! HTTP and websocket control surface.
//!
//! A thin adapter over [`EngineHandle`]: every route validates its input,
//! forwards one engine call and maps the outcome to a status code with a
//! `{success, message}` JSON body.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broadcast::{StreamEvent, StreamSummary, Topic};
use crate::engine::EngineHandle;
use crate::error::{EngineError, PreconditionError};
use crate::stream::{StreamId, StreamStatus};
use crate::transcode::Destination;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("HTTP server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatusResponse {
    pub stream_id: StreamId,
    pub status: StreamStatus,
}

#[derive(Debug, Deserialize)]
struct CreateStreamRequest {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DestinationRequest {
    #[serde(default)]
    rtmp_url: String,
    #[serde(default)]
    stream_key: String,
}

impl DestinationRequest {
    fn into_destination(self) -> Result<Destination, PreconditionError> {
        Destination::new(&self.rtmp_url, &self.stream_key)
    }
}

/// Engine error rendered as an HTTP response.
#[derive(Debug)]
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl From<PreconditionError> for ApiError {
    fn from(e: PreconditionError) -> Self {
        ApiError(EngineError::Precondition(e))
    }
}

fn status_code(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Precondition(p) => match p {
            PreconditionError::InvalidStreamId(_)
            | PreconditionError::MissingDestination
            | PreconditionError::InvalidAssetName(_)
            | PreconditionError::NoAssets(_) => StatusCode::BAD_REQUEST,
            PreconditionError::StreamExists(_) | PreconditionError::AlreadyRunning(_) => {
                StatusCode::CONFLICT
            }
            PreconditionError::UnknownStream(_) => StatusCode::NOT_FOUND,
        },
        EngineError::Launch(_) | EngineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = status_code(&self.0);
        if code.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        let body = ApiResponse {
            success: false,
            message: self.0.to_string(),
        };
        (code, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Handler for GET /streams
async fn list_streams(State(engine): State<EngineHandle>) -> ApiResult<Json<Vec<StreamSummary>>> {
    Ok(Json(engine.list_streams().await?))
}

/// Handler for POST /streams
async fn create_stream(
    State(engine): State<EngineHandle>,
    Json(body): Json<CreateStreamRequest>,
) -> ApiResult<(StatusCode, Json<ApiResponse>)> {
    let id = engine.register_stream(&body.id).await?;
    Ok((
        StatusCode::CREATED,
        ApiResponse::ok(format!("Stream '{}' created", id)),
    ))
}

/// Handler for GET /streams/:id
async fn get_stream(
    State(engine): State<EngineHandle>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<StreamStatusResponse>> {
    let id = StreamId::parse(&raw_id)?;
    let status = engine.status(&id).await?;
    Ok(Json(StreamStatusResponse {
        stream_id: id,
        status,
    }))
}

/// Handler for POST /streams/:id/start
async fn start_stream(
    State(engine): State<EngineHandle>,
    Path(raw_id): Path<String>,
    Json(body): Json<DestinationRequest>,
) -> ApiResult<Json<ApiResponse>> {
    let id = StreamId::parse(&raw_id)?;
    let destination = body.into_destination()?;
    engine.start(&id, destination).await?;
    Ok(ApiResponse::ok("Stream started"))
}

/// Handler for POST /streams/:id/stop
async fn stop_stream(
    State(engine): State<EngineHandle>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<ApiResponse>> {
    let id = StreamId::parse(&raw_id)?;
    if engine.stop(&id).await? {
        Ok(ApiResponse::ok("Stream stopped"))
    } else {
        Ok(ApiResponse::ok("Stream was not running"))
    }
}

/// Handler for POST /streams/:id/restart
async fn restart_stream(
    State(engine): State<EngineHandle>,
    Path(raw_id): Path<String>,
    Json(body): Json<DestinationRequest>,
) -> ApiResult<Json<ApiResponse>> {
    let id = StreamId::parse(&raw_id)?;
    let destination = body.into_destination()?;
    engine.restart(&id, destination).await?;
    Ok(ApiResponse::ok("Stream restarting"))
}

/// Handler for DELETE /streams/:id/assets/:name
async fn delete_asset(
    State(engine): State<EngineHandle>,
    Path((raw_id, name)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<ApiResponse>)> {
    let id = StreamId::parse(&raw_id)?;
    if engine.remove_asset(&id, &name).await? {
        Ok((StatusCode::OK, ApiResponse::ok("Asset deleted")))
    } else {
        Ok((
            StatusCode::NOT_FOUND,
            Json(ApiResponse {
                success: false,
                message: format!("Asset '{}' not found", name),
            }),
        ))
    }
}

/// Handler for GET /events
async fn all_events(State(engine): State<EngineHandle>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| forward_events(socket, engine, Topic::All))
}

/// Handler for GET /streams/:id/events
async fn stream_events(
    State(engine): State<EngineHandle>,
    Path(raw_id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let id = StreamId::parse(&raw_id)?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, engine, Topic::Stream(id))))
}

/// Sends a snapshot, then live events, until either side goes away.
async fn forward_events(mut socket: WebSocket, engine: EngineHandle, topic: Topic) {
    // Subscribe first so nothing published after the snapshot is missed
    let mut subscription = engine.subscribe(topic);
    let observer = subscription.id();
    debug!(%observer, topic = ?subscription.topic(), "observer connected");

    let streams = match engine.list_streams().await {
        Ok(streams) => streams,
        Err(e) => {
            warn!(%observer, error = %e, "cannot build snapshot");
            return;
        }
    };
    let streams = match subscription.topic() {
        Topic::All => streams,
        Topic::Stream(id) => streams.into_iter().filter(|s| &s.stream_id == id).collect(),
    };
    if send_event(&mut socket, &StreamEvent::Snapshot { streams })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Observers are read-only
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(%observer, "observer disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            warn!(error = %e, "failed to serialize event");
            Ok(())
        }
    }
}

/// Creates the axum Router with all control routes
pub fn create_router(engine: EngineHandle) -> Router {
    Router::new()
        .route("/streams", get(list_streams).post(create_stream))
        .route("/streams/:id", get(get_stream))
        .route("/streams/:id/start", post(start_stream))
        .route("/streams/:id/stop", post(stop_stream))
        .route("/streams/:id/restart", post(restart_stream))
        .route("/streams/:id/assets/:name", delete(delete_asset))
        .route("/streams/:id/events", get(stream_events))
        .route("/events", get(all_events))
        .with_state(engine)
}

/// Serves the control API on `addr` until `shutdown` resolves.
pub async fn run_server<F>(engine: EngineHandle, addr: SocketAddr, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MediaClass;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::worker::testing::FakeLauncher;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    type WsClient = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    struct TestApp {
        temp: TempDir,
        router: Router,
        launcher: FakeLauncher,
    }

    fn test_app() -> TestApp {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.uploads_dir = temp.path().join("uploads");
        config.storage.transient_dir = temp.path().join("streams");
        config.supervisor.restart_delay_secs = 0;

        let launcher = FakeLauncher::new();
        let (engine, handle) = Engine::new(&config, Arc::new(launcher.clone()));
        tokio::spawn(engine.run());
        TestApp {
            temp,
            router: create_router(handle),
            launcher,
        }
    }

    impl TestApp {
        async fn send(&self, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
            let builder = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, json)
        }

        fn add_asset(&self, id: &str, class: MediaClass, name: &str) {
            let path = self
                .temp
                .path()
                .join("uploads")
                .join(id)
                .join(class.as_str())
                .join(name);
            std::fs::File::create(path).unwrap();
        }
    }

    fn destination_body() -> serde_json::Value {
        serde_json::json!({"rtmp_url": "rtmp://live.example.com/app", "stream_key": "key"})
    }

    #[tokio::test]
    async fn test_create_stream() {
        let app = test_app();

        let (status, body) = app
            .send("POST", "/streams", Some(serde_json::json!({"id": "demo"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);

        let (status, body) = app
            .send("POST", "/streams", Some(serde_json::json!({"id": "demo"})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, _) = app
            .send("POST", "/streams", Some(serde_json::json!({"id": "bad id"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_stream_status() {
        let app = test_app();
        app.send("POST", "/streams", Some(serde_json::json!({"id": "demo"})))
            .await;

        let (status, body) = app.send("GET", "/streams/demo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stream_id"], "demo");
        assert_eq!(body["status"], "created");

        let (status, _) = app.send("GET", "/streams/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let app = test_app();
        app.send("POST", "/streams", Some(serde_json::json!({"id": "demo"})))
            .await;

        let (status, body) = app
            .send("POST", "/streams/demo/start", Some(destination_body()))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("no media files"));

        app.add_asset("demo", MediaClass::Video, "clip.mp4");
        let (status, body) = app
            .send(
                "POST",
                "/streams/demo/start",
                Some(serde_json::json!({"rtmp_url": "rtmp://host/app"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("required"));
        assert_eq!(app.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let app = test_app();
        app.send("POST", "/streams", Some(serde_json::json!({"id": "demo"})))
            .await;
        app.add_asset("demo", MediaClass::Audio, "song.mp3");

        let (status, body) = app
            .send("POST", "/streams/demo/start", Some(destination_body()))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(app.launcher.launch_count(), 1);

        let (status, _) = app
            .send("POST", "/streams/demo/start", Some(destination_body()))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let mut streaming = false;
        for _ in 0..50 {
            let (_, body) = app.send("GET", "/streams/demo", None).await;
            if body["status"] == "streaming" {
                streaming = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(streaming);

        let (status, body) = app.send("POST", "/streams/demo/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Stream stopped");

        let (_, body) = app.send("POST", "/streams/demo/stop", None).await;
        assert_eq!(body["message"], "Stream was not running");
    }

    #[tokio::test]
    async fn test_list_streams() {
        let app = test_app();
        app.send("POST", "/streams", Some(serde_json::json!({"id": "b"})))
            .await;
        app.send("POST", "/streams", Some(serde_json::json!({"id": "a"})))
            .await;
        app.add_asset("a", MediaClass::Video, "one.png");
        app.add_asset("a", MediaClass::Audio, "song.mp3");

        let (status, body) = app.send("GET", "/streams", None).await;
        assert_eq!(status, StatusCode::OK);
        let streams = body.as_array().unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0]["stream_id"], "a");
        assert_eq!(streams[0]["video_count"], 1);
        assert_eq!(streams[0]["audio_count"], 1);
        assert_eq!(streams[0]["is_running"], false);
    }

    #[tokio::test]
    async fn test_delete_asset() {
        let app = test_app();
        app.send("POST", "/streams", Some(serde_json::json!({"id": "demo"})))
            .await;
        app.add_asset("demo", MediaClass::Video, "clip.mp4");

        let (status, _) = app.send("DELETE", "/streams/demo/assets/clip.mp4", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = app.send("DELETE", "/streams/demo/assets/clip.mp4", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_restart_requires_destination() {
        let app = test_app();
        app.send("POST", "/streams", Some(serde_json::json!({"id": "demo"})))
            .await;

        let (status, _) = app
            .send("POST", "/streams/demo/restart", Some(serde_json::json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        app.add_asset("demo", MediaClass::Video, "clip.mp4");
        let (status, _) = app
            .send("POST", "/streams/demo/restart", Some(destination_body()))
            .await;
        assert_eq!(status, StatusCode::OK);

        for _ in 0..50 {
            if app.launcher.launch_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(app.launcher.launch_count(), 1);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (PreconditionError::InvalidStreamId("x y".into()), StatusCode::BAD_REQUEST),
            (PreconditionError::StreamExists("a".into()), StatusCode::CONFLICT),
            (PreconditionError::AlreadyRunning("a".into()), StatusCode::CONFLICT),
            (PreconditionError::UnknownStream("a".into()), StatusCode::NOT_FOUND),
            (PreconditionError::NoAssets("a".into()), StatusCode::BAD_REQUEST),
            (PreconditionError::MissingDestination, StatusCode::BAD_REQUEST),
        ];
        for (error, expected) in cases {
            assert_eq!(status_code(&EngineError::Precondition(error)), expected);
        }
        assert_eq!(
            status_code(&EngineError::EngineStopped),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    /// Serves the app on an ephemeral port for websocket clients.
    async fn serve(app: &TestApp) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app.router.clone();
        tokio::spawn(async move { axum::serve(listener, router).await });
        addr
    }

    async fn connect(addr: SocketAddr, path: &str) -> WsClient {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, path))
            .await
            .unwrap();
        socket
    }

    async fn next_json(socket: &mut WsClient) -> serde_json::Value {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for websocket frame")
                .expect("websocket closed")
                .unwrap();
            if let WsMessage::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Skips frames until a `status` event arrives.
    async fn next_status(socket: &mut WsClient) -> serde_json::Value {
        loop {
            let frame = next_json(socket).await;
            if frame["type"] == "status" {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_events_socket_sends_snapshot_then_status() {
        let app = test_app();
        for id in ["demo", "other"] {
            app.send("POST", "/streams", Some(serde_json::json!({"id": id})))
                .await;
        }
        app.add_asset("demo", MediaClass::Video, "clip.mp4");
        let addr = serve(&app).await;

        let mut socket = connect(addr, "/events").await;
        let snapshot = next_json(&mut socket).await;
        assert_eq!(snapshot["type"], "snapshot");
        let ids: Vec<&str> = snapshot["streams"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["stream_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["demo", "other"]);
        assert_eq!(snapshot["streams"][0]["video_count"], 1);

        let (status, _) = app
            .send("POST", "/streams/demo/start", Some(destination_body()))
            .await;
        assert_eq!(status, StatusCode::OK);

        let event = next_status(&mut socket).await;
        assert_eq!(event["stream_id"], "demo");
        assert_eq!(event["status"], "streaming");
        assert!(event.get("message").is_none());
    }

    #[tokio::test]
    async fn test_stream_socket_only_sees_its_stream() {
        let app = test_app();
        for id in ["demo", "other"] {
            app.send("POST", "/streams", Some(serde_json::json!({"id": id})))
                .await;
            app.add_asset(id, MediaClass::Video, "clip.mp4");
        }
        let addr = serve(&app).await;

        let mut socket = connect(addr, "/streams/demo/events").await;
        let snapshot = next_json(&mut socket).await;
        assert_eq!(snapshot["type"], "snapshot");
        let streams = snapshot["streams"].as_array().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0]["stream_id"], "demo");

        // The other stream changes first; none of it may reach this socket
        app.send("POST", "/streams/other/start", Some(destination_body()))
            .await;
        app.send("POST", "/streams/other/stop", None).await;
        app.send("POST", "/streams/demo/start", Some(destination_body()))
            .await;

        let event = next_json(&mut socket).await;
        assert_eq!(event["type"], "status");
        assert_eq!(event["stream_id"], "demo");
        assert_eq!(event["status"], "streaming");
        assert_eq!(app.launcher.launch_count(), 2);
    }
}
