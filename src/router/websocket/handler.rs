//! Console stream and bidirectional control WebSocket upgrades (spec §6).

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::{self, scope, Claims};
use crate::events::Event;
use crate::server::{Manager, PowerAction, Program};

use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

fn authenticate(state: &AppState, token: &str) -> Result<Claims, String> {
    auth::validate_token(token, &state.config.auth.public_key).map_err(|e| e.to_string())
}

/// `GET /{id}/console`: initial snapshot then live console lines.
pub async fn console_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_console_socket(socket, state, id, query.token))
}

async fn handle_console_socket(mut socket: WebSocket, state: AppState, id: String, token: String) {
    if let Err(e) = authenticate(&state, &token) {
        let _ = socket.send(Message::Text(json!({ "error": e }).to_string())).await;
        return;
    }

    let program = match state.manager.get(&id) {
        Some(p) => p,
        None => {
            let _ = socket
                .send(Message::Text(json!({ "error": "server not found" }).to_string()))
                .await;
            return;
        }
    };

    let snapshot = program.environment().get_console();
    for line in snapshot.lines {
        if socket.send(Message::Text(json!({ "line": line }).to_string())).await.is_err() {
            return;
        }
    }

    let mut events = program.events().subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => { warn!("console socket error: {}", e); break; }
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(Event::ConsoleOutput(bytes)) => {
                        let line = String::from_utf8_lossy(&bytes).to_string();
                        if socket.send(Message::Text(json!({ "line": line }).to_string())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

/// `GET /{id}/socket`: bidirectional control protocol.
pub async fn control_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_control_socket(socket, state, id, query.token))
}

async fn handle_control_socket(mut socket: WebSocket, state: AppState, id: String, token: String) {
    let claims = match authenticate(&state, &token) {
        Ok(c) => c,
        Err(e) => {
            let _ = socket.send(Message::Text(json!({ "error": e }).to_string())).await;
            return;
        }
    };

    let program = match state.manager.get(&id) {
        Some(p) => p,
        None => {
            let _ = socket
                .send(Message::Text(json!({ "error": "server not found" }).to_string()))
                .await;
            return;
        }
    };

    loop {
        let incoming = match socket.recv().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!("control socket error: {}", e);
                break;
            }
            _ => continue,
        };

        let reply = dispatch(&incoming, &program, &state.manager, &claims, &state).await;
        if socket.send(Message::Text(reply.to_string())).await.is_err() {
            break;
        }
    }
}

async fn dispatch(
    raw: &str,
    program: &std::sync::Arc<Program>,
    manager: &Manager,
    claims: &Claims,
    state: &AppState,
) -> Value {
    let msg: Inbound = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(_) => return json!({ "error": "unknown command" }),
    };

    let scoped = |required: &str| claims.has_scope(required);

    match msg.kind.as_str() {
        "stat" => {
            if !scoped(scope::STAT) {
                return forbidden(scope::STAT);
            }
            match program.environment().get_stats().await {
                Ok(sample) => json!({ "type": "stat", "cpu": sample.cpu_percent, "memory": sample.memory_rss_bytes }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        "start" => {
            if !scoped(scope::START) {
                return forbidden(scope::START);
            }
            manager.enqueue_start(std::sync::Arc::clone(program));
            json!({ "type": "start" })
        }
        "stop" => {
            if !scoped(scope::STOP) {
                return forbidden(scope::STOP);
            }
            match program.handle_power_action(PowerAction::Stop).await {
                Ok(()) => json!({ "type": "stop" }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        "kill" => {
            if !scoped(scope::STOP) {
                return forbidden(scope::STOP);
            }
            match program.handle_power_action(PowerAction::Kill).await {
                Ok(()) => json!({ "type": "kill" }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        "install" => {
            if !scoped(scope::INSTALL) {
                return forbidden(scope::INSTALL);
            }
            let program = std::sync::Arc::clone(program);
            tokio::spawn(async move {
                if let Err(e) = program.install().await {
                    debug!("install pipeline failed for {}: {}", program.id(), e);
                }
            });
            json!({ "type": "install" })
        }
        "reload" => {
            if !scoped(scope::EDIT_ADMIN) {
                return forbidden(scope::EDIT_ADMIN);
            }
            match manager.reload(&program.id()) {
                Ok(()) => json!({ "type": "reload" }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        "console" => {
            if !scoped(scope::CONSOLE_SEND) {
                return forbidden(scope::CONSOLE_SEND);
            }
            let Some(command) = msg.command else {
                return json!({ "error": "missing command" });
            };
            match program.execute(&command).await {
                Ok(()) => json!({ "type": "console" }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        "file" => handle_file(&msg, program, claims, state).await,
        "ping" => json!({ "type": "pong" }),
        _ => json!({ "error": "unknown command" }),
    }
}

fn forbidden(required: &str) -> Value {
    json!({ "error": format!("missing scope {required}") })
}

async fn handle_file(msg: &Inbound, program: &std::sync::Arc<Program>, claims: &Claims, state: &AppState) -> Value {
    let Some(path) = msg.path.clone() else {
        return json!({ "error": "missing path" });
    };
    match msg.action.as_deref() {
        Some("get") => {
            if !claims.has_scope(scope::FILES) {
                return forbidden(scope::FILES);
            }
            match program.filesystem().stat(&path).await {
                Ok(info) if !info.is_directory && info.size <= state.config.data.max_ws_download_size => {
                    match program.filesystem().read_file(&path).await {
                        Ok(data) => json!({ "type": "file", "data": base64_encode(&data) }),
                        Err(e) => json!({ "error": e.to_string() }),
                    }
                }
                Ok(_) => json!({ "url": format!("/server/{}/file/{}", program.id(), path) }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        Some("create") => {
            if !claims.has_scope(scope::FILES_PUT) {
                return forbidden(scope::FILES_PUT);
            }
            match program.filesystem().create_directory(&path).await {
                Ok(()) => json!({ "type": "file" }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        Some("delete") => {
            if !claims.has_scope(scope::FILES_DELETE) {
                return forbidden(scope::FILES_DELETE);
            }
            match program.filesystem().delete(&path).await {
                Ok(()) => json!({ "type": "file" }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        _ => json!({ "error": "unknown command" }),
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}
