//! HTTP and WebSocket surface of the relay.
//!
//! `POST /api/chat` relays the bridge's event stream to the caller as
//! NDJSON while appending every event to the session coordinator.
//! Authorization happens entirely before the backend is touched; once
//! the stream is flowing, failures surface as terminal events rather
//! than HTTP errors. `GET /ws/{session_id}` attaches a subscriber
//! socket with catch-up-then-live ordering.

use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_protocol::{new_id, ChatRequest, Event, ExecutionMode, SubscriberMessage};

use crate::bridge::{BridgeError, SpawnSpec};
use crate::clock;
use crate::coordinator::CoordinatorHandle;
use crate::error::ApiError;
use crate::jobs::Job;
use crate::permissions::PermissionContext;
use crate::persistence::{self, PersistCommand};
use crate::sanitize::sanitize_text;
use crate::state::SharedContext;

const SESSION_COOKIE: &str = "relay_session";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity token from the `x-relay-role` header, falling back to the
/// session cookie. Absence is fine; it resolves to the default role.
fn extract_identity(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get("x-relay-role")
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }
    cookie_value(headers, SESSION_COOKIE)
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(name).and_then(|r| r.strip_prefix('=')) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Effective allow-list: the role's list, narrowed by the client's
/// request when it supplied one. The client can only shrink it.
fn effective_tools(ctx: &PermissionContext, requested: Option<&Vec<String>>) -> Vec<String> {
    match requested {
        Some(requested) => requested
            .iter()
            .filter(|t| ctx.allows_tool(t))
            .cloned()
            .collect(),
        None => ctx.allowed_tools.clone(),
    }
}

// ---------------------------------------------------------------------------
// POST /api/chat
// ---------------------------------------------------------------------------

pub async fn chat(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let identity = extract_identity(&headers);
    let perms = ctx.resolver.resolve(identity.as_deref());
    if perms.is_empty() {
        return Err(ApiError::Forbidden("no capabilities for this identity".into()));
    }

    if req.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".into()));
    }
    let prompt = sanitize_text(&req.prompt);

    if prompt.starts_with('/') {
        let command = prompt.split_whitespace().next().unwrap_or(&prompt);
        if !perms.allows_command(command) {
            return Err(ApiError::Forbidden(format!(
                "command {} not allowed for role",
                command
            )));
        }
    }

    let options = req.options.unwrap_or_default();
    let continuation = req.session_id.is_some();
    let session_id = req.session_id.unwrap_or_else(new_id);
    let mode = ctx
        .bridge
        .decide_mode(&prompt, continuation, options.persist);

    if !continuation {
        // The id in the response must already resolve when the
        // client's next request reads it back
        persistence::create_session_now(
            ctx.db_path.clone(),
            session_id.clone(),
            mode,
            perms.role,
            clock::now_iso(),
        )
        .await
        .map_err(|e| ApiError::Persistence(e.to_string()))?;
    } else if persistence::load_session(ctx.db_path.clone(), session_id.clone())
        .await
        .map_err(|e| ApiError::Persistence(e.to_string()))?
        .is_none()
    {
        return Err(ApiError::NotFound(format!("session {}", session_id)));
    }

    let coordinator = ctx.coordinators.get_or_load(&session_id).await;
    let seq_start = coordinator.next_seq().await;

    let spec = SpawnSpec {
        bin: ctx.bridge.agent_bin().to_string(),
        working_dir: options.working_dir.clone(),
        allowed_tools: effective_tools(&perms, options.allowed_tools.as_ref()),
        denied_patterns: perms.denied_patterns.clone(),
        permission_mode: options.permission_mode.clone(),
        system_prompt: options.system_prompt.clone(),
        max_turns: options.max_turns,
    };

    let rx = ctx
        .bridge
        .run_turn(&session_id, mode, &prompt, &spec, seq_start)
        .await
        .map_err(|e| match e {
            BridgeError::Capacity(n) => ApiError::Capacity(format!("{} live processes", n)),
            other => ApiError::Backend(other.to_string()),
        })?;

    info!(
        component = "gateway",
        event = "gateway.turn_started",
        session_id = %session_id,
        mode = ?mode,
        role = ?perms.role,
        continuation = continuation,
        "Relaying turn"
    );

    let stream = relay_stream(
        session_id.clone(),
        rx,
        coordinator,
        ctx.bridge.request_timeout(),
        seq_start,
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(
            header::SET_COOKIE,
            format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, session_id),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Backend(e.to_string()))?;

    Ok(response)
}

/// Relay bridge events as NDJSON frames, flushing per event. Every
/// event is also appended to the coordinator; coordinator trouble
/// never aborts the client stream. A vanished upstream or an expired
/// deadline yields a synthesized terminal error, never a silent close.
fn relay_stream(
    session_id: String,
    mut rx: mpsc::Receiver<Event>,
    coordinator: CoordinatorHandle,
    timeout: Duration,
    seq_start: u64,
) -> impl futures::Stream<Item = Result<Bytes, std::convert::Infallible>> {
    async_stream::stream! {
        let deadline = tokio::time::Instant::now() + timeout;
        // Where a synthesized terminal would land; a turn that died
        // before its first event still continues the session sequence
        let mut next_seq = seq_start;
        let mut finished = false;

        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        component = "gateway",
                        event = "gateway.stream_timeout",
                        session_id = %session_id,
                        "Turn exceeded request timeout"
                    );
                    break;
                }
            };

            next_seq = event.seq + 1;
            let terminal = event.is_terminal();
            coordinator.append(event.clone()).await;
            yield Ok(ndjson_line(&event));

            if terminal {
                finished = true;
                break;
            }
        }

        if !finished {
            let event = Event::terminal_error(
                session_id.clone(),
                next_seq,
                clock::now_iso(),
                "backend stream ended without a result",
                None,
            );
            coordinator.append(event.clone()).await;
            yield Ok(ndjson_line(&event));
        }
    }
}

fn ndjson_line(event: &Event) -> Bytes {
    let mut line = serde_json::to_vec(event).unwrap_or_else(|_| b"{}".to_vec());
    line.push(b'\n');
    Bytes::from(line)
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

pub async fn create_session(
    State(ctx): State<SharedContext>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = extract_identity(&headers);
    let perms = ctx.resolver.resolve(identity.as_deref());

    let session_id = new_id();
    let created_at = clock::now_iso();
    persistence::create_session_now(
        ctx.db_path.clone(),
        session_id.clone(),
        ExecutionMode::Persistent,
        perms.role,
        created_at.clone(),
    )
    .await
    .map_err(|e| ApiError::Persistence(e.to_string()))?;

    info!(
        component = "gateway",
        event = "gateway.session_created",
        session_id = %session_id,
        role = ?perms.role,
        "Created session"
    );

    let body = Json(json!({
        "id": session_id,
        "mode": "persistent",
        "role": perms.role,
        "created_at": created_at,
    }));

    Ok((
        StatusCode::CREATED,
        [(
            header::SET_COOKIE,
            format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, session_id),
        )],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_sessions(
    State(ctx): State<SharedContext>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.min(500);
    let sessions = persistence::list_sessions(ctx.db_path.clone(), limit, query.offset)
        .await
        .map_err(|e| ApiError::Persistence(e.to_string()))?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn get_session(
    State(ctx): State<SharedContext>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = persistence::load_session(ctx.db_path.clone(), session_id.clone())
        .await
        .map_err(|e| ApiError::Persistence(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("session {}", session_id)))?;
    Ok(Json(summary))
}

pub async fn delete_session(
    State(ctx): State<SharedContext>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    if persistence::load_session(ctx.db_path.clone(), session_id.clone())
        .await
        .map_err(|e| ApiError::Persistence(e.to_string()))?
        .is_none()
    {
        return Err(ApiError::NotFound(format!("session {}", session_id)));
    }

    ctx.bridge.evict(&session_id, "deleted").await;
    ctx.coordinators.remove(&session_id);
    ctx.persist_tx
        .try_send(PersistCommand::SessionDelete {
            id: session_id.clone(),
        })
        .map_err(|_| ApiError::Persistence("write queue full".into()))?;

    info!(
        component = "gateway",
        event = "gateway.session_deleted",
        session_id = %session_id,
        "Deleted session"
    );

    Ok((
        StatusCode::NO_CONTENT,
        [(
            header::SET_COOKIE,
            format!("{}=; Path=/; Max-Age=0", SESSION_COOKIE),
        )],
    )
        .into_response())
}

pub async fn interrupt_session(
    State(ctx): State<SharedContext>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let delivered = ctx.bridge.interrupt(&session_id);
    Json(json!({ "session_id": session_id, "interrupted": delivered }))
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

pub async fn upload(
    State(ctx): State<SharedContext>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut session_id: Option<String> = None;
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?
    {
        match field.name() {
            Some("session_id") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                session_id = Some(value);
            }
            Some("file") => {
                let name = field
                    .file_name()
                    .unwrap_or("upload.bin")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                file = Some((name, data));
            }
            _ => {}
        }
    }

    let session_id =
        session_id.ok_or_else(|| ApiError::Validation("missing session_id field".into()))?;
    let (file_name, data) =
        file.ok_or_else(|| ApiError::Validation("missing file field".into()))?;

    let key = ctx
        .blobs
        .put(&session_id, &file_name, &data)
        .await
        .map_err(|e| ApiError::Persistence(e.to_string()))?;

    let _ = ctx.persist_tx.try_send(PersistCommand::ArtifactCreate {
        key: key.clone(),
        session_id: session_id.clone(),
        file_name,
        size_bytes: data.len() as u64,
        uploaded_at: clock::now_iso(),
    });

    // Post-processing always runs, decoupled from the response
    if ctx
        .job_tx
        .try_send(Job::process_upload(key.clone(), session_id.clone()))
        .is_err()
    {
        warn!(
            component = "gateway",
            session_id = %session_id,
            key = %key,
            "Job queue full, upload post-processing skipped"
        );
    }

    Ok(Json(json!({
        "key": key,
        "url": format!("/api/files/{}", key),
    })))
}

pub async fn get_file(
    State(ctx): State<SharedContext>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let data = ctx.blobs.get(&key).await.map_err(|e| match e {
        crate::blobs::BlobError::NotFound(k) => ApiError::NotFound(format!("artifact {}", k)),
        crate::blobs::BlobError::InvalidKey(k) => ApiError::Validation(format!("bad key {}", k)),
        other => ApiError::Persistence(other.to_string()),
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(data))
        .map_err(|e| ApiError::Persistence(e.to_string()))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health(State(ctx): State<SharedContext>) -> impl IntoResponse {
    let agent_found = agent_binary_reachable(ctx.bridge.agent_bin());
    let status = if agent_found { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "agent_bin_found": agent_found,
        "auth_enabled": ctx.config.auth_token.is_some(),
        "live_processes": ctx.bridge.live_processes(),
        "max_processes": ctx.config.max_processes,
    }))
}

fn agent_binary_reachable(bin: &str) -> bool {
    if bin.contains('/') {
        return std::path::Path::new(bin).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// GET /ws/{session_id}
// ---------------------------------------------------------------------------

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<SharedContext>,
    Path(session_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| subscriber_connection(socket, ctx, session_id))
}

/// Final frame for a subscriber the server is about to disconnect
fn stream_closed_frame() -> SubscriberMessage {
    SubscriberMessage::Error {
        code: "stream_closed".to_string(),
        message: "session stream closed by the server".to_string(),
    }
}

/// One subscriber socket. The coordinator owns delivery ordering; this
/// task only shuttles frames. The channel is small on purpose: a
/// subscriber that cannot keep up gets dropped by the coordinator
/// instead of stalling upstream reads.
async fn subscriber_connection(mut socket: WebSocket, ctx: SharedContext, session_id: String) {
    let subscriber_id = new_id();
    let (tx, mut rx) = mpsc::channel::<SubscriberMessage>(64);

    let coordinator = ctx.coordinators.get_or_load(&session_id).await;
    let count = coordinator.attach(subscriber_id.clone(), tx).await;

    info!(
        component = "gateway",
        event = "gateway.subscriber_attached",
        session_id = %session_id,
        subscriber_id = %subscriber_id,
        subscriber_count = ?count,
        "Subscriber attached"
    );

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        let text = match serde_json::to_string(&msg) {
                            Ok(t) => t,
                            Err(_) => continue,
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Coordinator dropped us (slow consumer or clear);
                    // tell the socket why before closing it
                    None => {
                        if let Ok(text) = serde_json::to_string(&stream_closed_frame()) {
                            let _ = socket.send(Message::Text(text.into())).await;
                        }
                        break;
                    }
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {
                        // Subscriber sockets are read-only
                        debug!(
                            component = "gateway",
                            session_id = %session_id,
                            "Ignoring inbound subscriber frame"
                        );
                    }
                }
            }
        }
    }

    coordinator.detach(subscriber_id.clone()).await;
    info!(
        component = "gateway",
        event = "gateway.subscriber_detached",
        session_id = %session_id,
        subscriber_id = %subscriber_id,
        "Subscriber detached"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::context_for_role;
    use relay_protocol::Role;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn identity_prefers_header_over_cookie() {
        let headers = headers_with(&[
            ("x-relay-role", "admin:alice"),
            ("cookie", "relay_session=abc123"),
        ]);
        assert_eq!(extract_identity(&headers).as_deref(), Some("admin:alice"));
    }

    #[test]
    fn identity_falls_back_to_cookie() {
        let headers = headers_with(&[("cookie", "other=x; relay_session=abc123; theme=dark")]);
        assert_eq!(extract_identity(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn anonymous_request_has_no_identity() {
        assert!(extract_identity(&HeaderMap::new()).is_none());
    }

    #[test]
    fn client_tool_list_can_only_narrow() {
        let perms = context_for_role(Role::Developer);
        let requested = vec!["Bash".to_string(), "KillShell".to_string()];
        let effective = effective_tools(&perms, Some(&requested));
        // KillShell is admin-only; the client cannot grant it to itself
        assert_eq!(effective, vec!["Bash".to_string()]);

        let full = effective_tools(&perms, None);
        assert_eq!(full, perms.allowed_tools);
    }

    #[tokio::test]
    async fn synthesized_terminal_continues_session_sequence() {
        use crate::coordinator::CoordinatorRegistry;
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let (persist_tx, _persist_rx) = mpsc::channel(64);
        let registry = CoordinatorRegistry::new(
            persist_tx,
            dir.path().join("none.db"),
            Duration::from_secs(60),
        );

        let coordinator = registry.get_or_load("s-relay").await;
        for seq in 0..3 {
            coordinator
                .append(Event::new(
                    "s-relay",
                    seq,
                    clock::now_iso(),
                    relay_protocol::EventPayload::KeepAlive,
                ))
                .await;
        }
        assert_eq!(coordinator.next_seq().await, 3);

        // Upstream dies before delivering a single event
        let (tx, rx) = mpsc::channel::<Event>(8);
        drop(tx);

        let stream = relay_stream(
            "s-relay".to_string(),
            rx,
            coordinator.clone(),
            Duration::from_secs(5),
            3,
        );
        let lines: Vec<_> = Box::pin(stream).collect().await;
        assert_eq!(lines.len(), 1);

        let bytes = lines[0].as_ref().unwrap();
        let event: Event = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert!(event.is_terminal());
        // Continues the transcript instead of colliding with seq 1
        assert_eq!(event.seq, 3);
        assert_eq!(coordinator.next_seq().await, 4);
    }

    #[test]
    fn closed_stream_frame_is_an_error_message() {
        let json = serde_json::to_string(&stream_closed_frame()).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("stream_closed"));
    }

    #[test]
    fn ndjson_lines_end_with_newline() {
        let event = Event::new(
            "s",
            0,
            clock::now_iso(),
            relay_protocol::EventPayload::KeepAlive,
        );
        let line = ndjson_line(&event);
        assert_eq!(line.last(), Some(&b'\n'));
        assert!(serde_json::from_slice::<Event>(&line[..line.len() - 1]).is_ok());
    }
}
