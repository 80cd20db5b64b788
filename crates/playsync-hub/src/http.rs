use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use playsync_proto::protocol::{
    CastRequest, ClientMessage, ControlCommand, MediaPage, PlayMode, PlayRequest, ServerMessage,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::core::{HubBroadcast, HubEvent, SharedPlayerState};
use crate::error::ApiError;
use crate::library::MediaLibrary;

#[derive(Clone)]
pub struct HubState {
    pub player: SharedPlayerState,
    pub event_tx: mpsc::Sender<HubEvent>,
    pub broadcast_tx: broadcast::Sender<HubBroadcast>,
    pub library: Arc<MediaLibrary>,
    clients: Arc<AtomicUsize>,
    next_client_id: Arc<AtomicU64>,
}

impl HubState {
    pub fn new(
        player: SharedPlayerState,
        event_tx: mpsc::Sender<HubEvent>,
        broadcast_tx: broadcast::Sender<HubBroadcast>,
        library: MediaLibrary,
    ) -> Self {
        Self {
            player,
            event_tx,
            broadcast_tx,
            library: Arc::new(library),
            clients: Arc::new(AtomicUsize::new(0)),
            next_client_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

#[derive(Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub clients: usize,
}

#[derive(Deserialize)]
struct MediaQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    q: Option<String>,
}

fn default_limit() -> usize {
    100
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media", get(list_media))
        .route("/play", post(play_items))
        .route("/cast/url", post(cast_url))
        .route("/ws/mpv", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HubState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("Hub listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, router(state)).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn health(State(state): State<HubState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        clients: state.client_count(),
    })
}

async fn list_media(
    State(state): State<HubState>,
    Query(query): Query<MediaQuery>,
) -> Result<Json<MediaPage>, ApiError> {
    let page = state
        .library
        .list(query.q.as_deref(), query.offset, query.limit)
        .await?;
    Ok(Json(page))
}

/// Load one or more library items.  `play` replaces mpv's playlist, `queue`
/// appends to it.
async fn play_items(
    State(state): State<HubState>,
    Json(request): Json<PlayRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.items.is_empty() {
        return Err(ApiError::BadRequest("no items to play".to_string()));
    }
    let targets = request
        .items
        .iter()
        .map(|item| {
            state
                .library
                .resolve(&item.path)
                .map(|path| path.to_string_lossy().into_owned())
        })
        .collect::<Result<Vec<_>, _>>()?;
    info!("HTTP: play {} item(s), mode {:?}", targets.len(), request.mode);

    let count = targets.len();
    launch(&state, targets, request.mode).await?;
    Ok(Json(serde_json::json!({
        "status": "playing",
        "count": count,
        "mode": request.mode,
    })))
}

/// Hand a remote URL (http, rtsp, magnet, ...) straight to mpv.
async fn cast_url(
    State(state): State<HubState>,
    Json(request): Json<CastRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = request.url.trim();
    if !is_castable_url(url) {
        return Err(ApiError::BadRequest(format!("not a castable url: {}", url)));
    }
    info!("HTTP: cast {} ({:?})", url, request.mode);
    launch(&state, vec![url.to_string()], request.mode).await?;
    Ok(Json(serde_json::json!({
        "status": "casting",
        "url": url,
        "mode": request.mode,
    })))
}

/// Remote schemes only; local files go through `/play` and the media root.
fn is_castable_url(url: &str) -> bool {
    if url.starts_with("magnet:?") {
        return true;
    }
    let Some((scheme, rest)) = url.split_once("://") else {
        return false;
    };
    !rest.is_empty()
        && !scheme.is_empty()
        && scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+.-".contains(c))
        && !scheme.eq_ignore_ascii_case("file")
}

async fn launch(state: &HubState, targets: Vec<String>, mode: PlayMode) -> Result<(), ApiError> {
    let (reply, rx) = oneshot::channel();
    state
        .event_tx
        .send(HubEvent::Launch {
            targets,
            mode,
            reply,
        })
        .await
        .map_err(|_| ApiError::Unavailable)?;
    rx.await
        .map_err(|_| ApiError::Unavailable)?
        .map_err(ApiError::Player)
}

// ── control channel ───────────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    match msg.encode() {
        Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            error!("failed to encode {:?}: {}", msg, e);
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: HubState) {
    let id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    let total = state.clients.fetch_add(1, Ordering::Relaxed) + 1;
    info!("Client {} connected. Total: {}", id, total);

    let (mut sender, mut receiver) = socket.split();
    // Subscribe before reading the snapshot so no change falls in between.
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    let snapshot = state.player.read().await.clone();
    if send_message(&mut sender, &ServerMessage::State { data: snapshot }).await {
        loop {
            tokio::select! {
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_frame(&state, id, &text).await {
                            if !send_message(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Client {} socket error: {}", id, e);
                        break;
                    }
                },

                msg = broadcast_rx.recv() => {
                    let outgoing = match msg {
                        Ok(HubBroadcast::State(data)) => Some(ServerMessage::State { data }),
                        Ok(HubBroadcast::CommandExecuted { origin, message }) if origin != id => {
                            Some(ServerMessage::CommandExecuted {
                                action: message.action,
                                params: message.params,
                            })
                        }
                        Ok(HubBroadcast::CommandExecuted { .. }) => None,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Client {} missed {} broadcasts, resending state", id, n);
                            let data = state.player.read().await.clone();
                            Some(ServerMessage::State { data })
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if let Some(out) = outgoing {
                        if !send_message(&mut sender, &out).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    let total = state.clients.fetch_sub(1, Ordering::Relaxed) - 1;
    info!("Client {} disconnected. Total: {}", id, total);
}

/// Execute one client frame.  Returns the error reply for the sender, if any.
async fn handle_frame(state: &HubState, client_id: u64, text: &str) -> Option<ServerMessage> {
    let error = |message: String| Some(ServerMessage::Error { message });

    let msg = match ClientMessage::decode(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Client {} sent malformed frame: {}", client_id, e);
            return error(format!("Invalid message: {}", e));
        }
    };
    let command = match ControlCommand::try_from(&msg) {
        Ok(c) => c,
        Err(e) => {
            warn!("Client {}: {}", client_id, e);
            return error(e.to_string());
        }
    };
    debug!("Client {} command: {:?}", client_id, command);

    let (reply, rx) = oneshot::channel();
    let event = HubEvent::Command {
        origin: client_id,
        command,
        reply,
    };
    if state.event_tx.send(event).await.is_err() {
        return error("hub is shutting down".to_string());
    }
    match rx.await {
        Ok(Ok(())) => None,
        Ok(Err(message)) => error(message),
        Err(_) => error("hub is shutting down".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hub;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use playsync_proto::config::Config;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
        let mut config = Config::default();
        config.hub.media_root = dir.path().to_path_buf();
        let state = Hub::new(config).spawn_core();
        (dir, router(state))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["clients"], 0);
    }

    #[tokio::test]
    async fn test_media_listing() {
        let (_dir, app) = app();
        let response = app
            .oneshot(Request::get("/media?limit=10").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["items"][0]["path"], "clip.mp4");
    }

    #[tokio::test]
    async fn test_play_rejects_bad_paths() {
        let (_dir, app) = app();
        let request = |path: &str| {
            Request::post("/play")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({ "path": path }).to_string()))
                .unwrap()
        };

        let response = app.clone().oneshot(request("../secret.mp4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(request("missing.mp4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "media not found: missing.mp4");
    }

    /// State whose event loop is the test itself, so launches can be inspected.
    fn detached_state(dir: &TempDir) -> (HubState, mpsc::Receiver<HubEvent>) {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);
        let state = HubState::new(
            Default::default(),
            event_tx,
            broadcast_tx,
            MediaLibrary::new(dir.path().to_path_buf()),
        );
        (state, event_rx)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_play_many_loads_whole_batch() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("show")).unwrap();
        for name in ["show/e1.mkv", "show/e2.mkv"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let (state, mut events) = detached_state(&dir);

        let request = post_json(
            "/play",
            serde_json::json!({
                "items": [{ "path": "show/e1.mkv" }, { "path": "show/e2.mkv" }],
                "mode": "queue",
            }),
        );
        let call = tokio::spawn(router(state).oneshot(request));

        let Some(HubEvent::Launch { targets, mode, reply }) = events.recv().await else {
            panic!("expected a launch");
        };
        assert_eq!(mode, PlayMode::Queue);
        assert_eq!(targets.len(), 2);
        assert!(targets[0].ends_with("e1.mkv"));
        assert!(targets[1].ends_with("e2.mkv"));
        reply.send(Ok(())).unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["mode"], "queue");
    }

    #[tokio::test]
    async fn test_play_batch_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"x").unwrap();
        let (state, mut events) = detached_state(&dir);
        let app = router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/play",
                serde_json::json!({ "items": [{ "path": "a.mkv" }, { "path": "gone.mkv" }] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(post_json("/play", serde_json::json!({ "items": [] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cast_url_forwards_mode() {
        let dir = TempDir::new().unwrap();
        let (state, mut events) = detached_state(&dir);
        let request = post_json(
            "/cast/url",
            serde_json::json!({ "url": "https://example.net/live.m3u8", "mode": "queue" }),
        );
        let call = tokio::spawn(router(state).oneshot(request));

        let Some(HubEvent::Launch { targets, mode, reply }) = events.recv().await else {
            panic!("expected a launch");
        };
        assert_eq!(targets, vec!["https://example.net/live.m3u8".to_string()]);
        assert_eq!(mode, PlayMode::Queue);
        reply.send(Err("mpv binary not found".to_string())).unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_castable_urls() {
        assert!(is_castable_url("rtsp://cam.local/stream"));
        assert!(is_castable_url("magnet:?xt=urn:btih:abc"));
        assert!(is_castable_url("ytdl://dQw4w9WgXcQ"));
        assert!(!is_castable_url("file:///etc/passwd"));
        assert!(!is_castable_url("/home/me/movie.mkv"));
        assert!(!is_castable_url("http://"));
    }
}
