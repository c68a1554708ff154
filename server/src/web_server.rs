//! Axum HTTP + WebSocket server: WS at /ws/{session} for terminal sharing,
//! read-only session listing at /api/sessions, optional static asset
//! fallback. One connection = one client attached to one session; the
//! session itself outlives any connection.

use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use common::assistant::AssistantKind;
use common::config::{self, Config};
use common::protocol::{self, ClientText, ServerMessage};
use common::session::{
    new_registry, ClientId, ClientSender, Outbound, Registry, Session, SessionId, SessionOptions,
};

/// Query params for /ws/{session}. `assistant` picks the command pair, `name`
/// seeds the display name, `parent` inherits another session's working
/// directory, `session=chat` selects the chat adjunct (external; logged).
#[derive(serde::Deserialize)]
struct WsQuery {
    assistant: Option<String>,
    name: Option<String>,
    parent: Option<String>,
    session: Option<String>,
}

#[derive(Clone)]
struct AppState {
    registry: Registry,
    config: &'static Config,
}

/// Session list item (GET /api/sessions).
#[derive(serde::Serialize)]
struct SessionListItem {
    session_id: String,
    assistant: String,
    status: String,
    viewers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    created_at: String,
    idle_secs: u64,
}

/// Runs the server: WebSocket terminal sharing plus the reaper. Binds to
/// 127.0.0.1 (localhost only). `assets_dir`, when given, is served as a
/// static fallback for the browser frontend.
pub async fn run_server(
    port: u16,
    assets_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = config::ensure_loaded();
    std::fs::create_dir_all(&config.working_dir)?;
    std::fs::create_dir_all(&config.recordings_dir)?;

    let state = AppState {
        registry: new_registry(),
        config,
    };
    crate::reaper::spawn(state.registry.clone(), config);

    let mut app = Router::new()
        .route("/ws/{session}", get(ws_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .with_state(state);
    if let Some(dir) = assets_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn ws_handler(
    Path(session): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let Ok(uuid) = uuid::Uuid::parse_str(&session) else {
        return (StatusCode::BAD_REQUEST, "invalid session id").into_response();
    };
    let id = SessionId(uuid);
    ws.on_upgrade(move |socket| handle_socket(socket, id, query, addr, state))
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<Vec<SessionListItem>> {
    let list = state
        .registry
        .iter()
        .map(|entry| {
            let session = entry.value();
            SessionListItem {
                session_id: session.id.to_string(),
                assistant: session.assistant.as_str().to_string(),
                status: session.state().label().to_string(),
                viewers: session.viewers(),
                name: session.name(),
                created_at: session.created_at.to_rfc3339(),
                idle_secs: session.idle_secs(),
            }
        })
        .collect();
    Json(list)
}

/// Look up a live session or create it. The working directory comes from the
/// `parent` session when given and alive, else from config.
fn get_or_create(state: &AppState, id: SessionId, query: &WsQuery) -> Arc<Session> {
    if let Some(existing) = state.registry.get(&id) {
        return existing.clone();
    }
    let work_dir = query
        .parent
        .as_deref()
        .and_then(|p| uuid::Uuid::parse_str(p).ok())
        .and_then(|parent| {
            state
                .registry
                .get(&SessionId(parent))
                .map(|s| s.work_dir.clone())
        })
        .unwrap_or_else(|| state.config.working_dir.clone());
    let assistant = AssistantKind::parse(query.assistant.as_deref());
    let opts = SessionOptions {
        recordings_dir: state.config.recordings_dir.clone(),
        motd: state.config.motd.clone(),
        input_grace: state.config.input_grace,
        scrollback_bytes: state.config.scrollback_bytes,
    };
    state
        .registry
        .entry(id)
        .or_insert_with(|| Session::new(id, assistant, work_dir, query.name.clone(), opts))
        .clone()
}

async fn handle_socket(
    socket: WebSocket,
    id: SessionId,
    query: WsQuery,
    addr: SocketAddr,
    state: AppState,
) {
    if query.session.as_deref() == Some("chat") {
        debug!("chat adjunct requested for {}; attaching as terminal", id.short());
    }
    let session = get_or_create(&state, id, &query);

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client_id = match session.attach(tx.clone(), 24, 80, addr.ip().to_string()) {
        Ok(client_id) => client_id,
        Err(e) => {
            warn!("attach to session {} failed: {}", id.short(), e);
            let mut socket = socket;
            let _ = socket
                .send(Message::Text(format!("session unavailable: {}", e).into()))
                .await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single writer task per connection: drains the client channel in order,
    // which is what serializes WebSocket writes.
    let queue_to_ws = async move {
        'drain: while let Some(msg) = rx.recv().await {
            match msg {
                Outbound::Binary(bytes) => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Outbound::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::CatchUp(payload) => {
                    // Gzip is CPU work; keep it off the reactor. Frames go
                    // out before the channel is polled again, so catch-up
                    // stays ahead of live bytes.
                    let frames = tokio::task::spawn_blocking(move || {
                        common::chunk::compressed_frames(&payload)
                    })
                    .await;
                    let frames = match frames {
                        Ok(Ok(frames)) => frames,
                        Ok(Err(e)) => {
                            warn!("catch-up compression failed: {}", e);
                            continue;
                        }
                        Err(e) => {
                            warn!("catch-up compression task failed: {}", e);
                            continue;
                        }
                    };
                    for frame in frames {
                        if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                            break 'drain;
                        }
                    }
                }
            }
        }
    };

    let reader_session = session.clone();
    let reader_tx = tx.clone();
    let ws_to_session = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Binary(frame) => {
                    handle_binary(&reader_session, client_id, &reader_tx, &frame).await;
                }
                Message::Text(text) => {
                    handle_text(&reader_session, &reader_tx, &text);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = queue_to_ws => {}
        _ = ws_to_session => {}
    }
    session.detach(client_id);
}

/// Binary demux: `0x00` resize, `0x01` file upload, anything else is raw
/// terminal input for the subprocess.
async fn handle_binary(session: &Arc<Session>, client_id: ClientId, tx: &ClientSender, frame: &[u8]) {
    if frame.is_empty() {
        return;
    }
    match frame[0] {
        // Any 0x00-prefixed frame is consumed here: a malformed one is a
        // protocol violation and must be dropped, never forwarded as input.
        protocol::FRAME_RESIZE => match protocol::parse_resize(frame) {
            Some((rows, cols)) => session.resize(client_id, rows, cols),
            None => debug!("dropping malformed resize frame"),
        },
        protocol::FRAME_FILE_UPLOAD => handle_upload(session, tx, frame).await,
        _ => {
            let session = session.clone();
            let bytes = frame.to_vec();
            // PTY writes are blocking; keep them off the reactor.
            let _ = tokio::task::spawn_blocking(move || session.write_input(&bytes)).await;
        }
    }
}

/// Text demux per the control-plane taxonomy. Protocol violations are logged
/// and dropped; the connection stays up.
fn handle_text(session: &Arc<Session>, tx: &ClientSender, raw: &str) {
    match protocol::parse_client_text(raw) {
        Some(ClientText::Ping { data }) => {
            let _ = tx.send(Outbound::Text(ServerMessage::Pong { data }.to_json()));
        }
        Some(ClientText::Chat { user_name, text }) => {
            if !user_name.trim().is_empty() && !text.trim().is_empty() {
                session.broadcast_chat(&user_name, &text);
            }
        }
        Some(ClientText::RenameSession { name }) => {
            // invalid names are silently ignored inside rename()
            session.rename(&name);
        }
        Some(ClientText::Unknown(kind)) => {
            debug!("ignoring unknown message type {:?}", kind);
        }
        None => debug!("dropping malformed text frame"),
    }
}

/// Save an uploaded file under the session working directory, acknowledge it,
/// and surface the saved path to the subprocess as typed input.
async fn handle_upload(session: &Arc<Session>, tx: &ClientSender, frame: &[u8]) {
    let Some((name, bytes)) = protocol::parse_file_upload(frame) else {
        debug!("dropping malformed upload frame");
        return;
    };
    let reply = match save_upload(&session.work_dir, &name, bytes).await {
        Ok(path) => {
            let saved = path.to_string_lossy().into_owned();
            session.write_input(saved.as_bytes());
            ServerMessage::FileUpload {
                success: true,
                filename: Some(saved),
                error: None,
            }
        }
        Err(e) => {
            warn!("upload of {:?} failed: {}", name, e);
            ServerMessage::FileUpload {
                success: false,
                filename: None,
                error: Some(e.to_string()),
            }
        }
    };
    let _ = tx.send(Outbound::Text(reply.to_json()));
}

async fn save_upload(work_dir: &FsPath, name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let dir = work_dir.join("uploads");
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(sanitize_filename(name));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

/// Strip directories and control characters from a client-supplied filename.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}
