use crate::errors::{ErrorBody, SandboxError, SandboxResult};
use crate::frame::StdStream;
use crate::models::{HealthResponse, SandboxState, SandboxSummary, UserIdentity, WindowSize};
use crate::session::Session;
use crate::workspace::Workspace;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{any, get};
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use futures::channel::mpsc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;
use utoipa::OpenApi as UtoipaOpenApi;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub workspace: Arc<Workspace>,
    /// Cancelled on server shutdown; every attached session derives from it.
    pub shutdown: CancellationToken,
}

#[derive(Deserialize)]
struct AttachParams {
    cols: Option<u16>,
    rows: Option<u16>,
    #[serde(default = "default_tty")]
    tty: bool,
}

fn default_tty() -> bool {
    true
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(health, ensure_sandbox, get_sandbox, remove_sandbox),
    components(schemas(
        SandboxSummary,
        SandboxState,
        UserIdentity,
        crate::models::SandboxId,
        HealthResponse,
        ErrorBody
    )),
    tags((name = "sandboxes", description = "Per-user shell sandboxes"))
)]
pub struct ApiDoc;

pub fn build_router(workspace: Arc<Workspace>, shutdown: CancellationToken) -> Router {
    let state = AppState {
        workspace,
        shutdown,
    };

    Router::new()
        .route("/healthz", get(health))
        .route("/openapi.json", get(openapi))
        .route(
            "/users/{user}/sandbox",
            get(get_sandbox).put(ensure_sandbox).delete(remove_sandbox),
        )
        .route("/users/{user}/attach", any(attach_session))
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    put,
    path = "/users/{user}/sandbox",
    params(("user" = String, Path, description = "User identity")),
    responses(
        (status = 200, description = "Sandbox exists and is registered", body = SandboxSummary),
        (status = 400, description = "Invalid user identity", body = ErrorBody),
        (status = 502, description = "Runtime failed to create the sandbox", body = ErrorBody)
    )
)]
async fn ensure_sandbox(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> SandboxResult<Json<SandboxSummary>> {
    let user = UserIdentity::new(user);
    state.workspace.ensure_user_sandbox(&user).await?;
    Ok(Json(state.workspace.summary(&user).await?))
}

#[utoipa::path(
    get,
    path = "/users/{user}/sandbox",
    params(("user" = String, Path, description = "User identity")),
    responses(
        (status = 200, description = "Sandbox detail", body = SandboxSummary),
        (status = 404, description = "No sandbox registered for the user", body = ErrorBody)
    )
)]
async fn get_sandbox(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> SandboxResult<Json<SandboxSummary>> {
    let summary = state.workspace.summary(&UserIdentity::new(user)).await?;
    Ok(Json(summary))
}

#[utoipa::path(
    delete,
    path = "/users/{user}/sandbox",
    params(("user" = String, Path, description = "User identity")),
    responses((status = 204, description = "Accepted; sandboxes are currently kept"))
)]
async fn remove_sandbox(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> SandboxResult<StatusCode> {
    state
        .workspace
        .remove_user_sandbox(&UserIdentity::new(user))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_session(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(params): Query<AttachParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = UserIdentity::new(user);
    ws.on_upgrade(move |socket| relay_socket(state, user, params, socket))
}

/// Bridges one WebSocket to a session.
///
/// Binary and text frames are stdin, except `resize:<rows>:<cols>` text frames
/// and an empty binary frame, which closes stdin. Output goes out as binary
/// frames. A tty has a single output stream, sent raw; otherwise each frame
/// starts with the stream selector byte (1 stdout, 2 stderr) and the payload
/// bytes follow unchanged.
async fn relay_socket(state: AppState, user: UserIdentity, params: AttachParams, socket: WebSocket) {
    let (mut sink, stream) = socket.split();
    let (stdin_writer, stdin_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (resize_tx, resize_rx) = mpsc::unbounded::<WindowSize>();

    if let (Some(cols), Some(rows)) = (params.cols, params.rows) {
        let _ = resize_tx.unbounded_send(WindowSize::new(cols, rows));
    }

    let mut session = Session::new(params.tty, stdin_reader, stdout_writer, stderr_writer);
    if params.tty {
        session = session.with_resize_events(resize_rx);
    }

    let cancel = state.shutdown.child_token();
    let inbound = tokio::spawn(pump_inbound(stream, stdin_writer, resize_tx, cancel.clone()));

    tracing::info!(%user, tty = params.tty, "websocket session attached");
    let (result, ()) = tokio::join!(state.workspace.connect(&user, session, &cancel), async {
        if let Err(error) = pump_outbound(&mut sink, stdout_reader, stderr_reader, !params.tty).await {
            tracing::debug!(%error, "websocket send failed; ending session");
            cancel.cancel();
        }
    });
    inbound.abort();

    match result {
        Ok(()) => tracing::info!(%user, "websocket session finished"),
        Err(SandboxError::SessionCancelled) => tracing::debug!(%user, "websocket session cancelled"),
        Err(error) => {
            tracing::warn!(%user, %error, "session failed");
            let _ = sink
                .send(Message::Text(format!("error: {error}").into()))
                .await;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn pump_inbound(
    mut stream: SplitStream<WebSocket>,
    mut stdin: DuplexStream,
    resizes: mpsc::UnboundedSender<WindowSize>,
    cancel: CancellationToken,
) {
    let mut stdin_open = true;
    while let Some(message) = stream.next().await {
        let data: Bytes = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => match parse_resize(text.as_str()) {
                Some(size) => {
                    let _ = resizes.unbounded_send(size);
                    continue;
                }
                None => Bytes::copy_from_slice(text.as_bytes()),
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        if !stdin_open {
            continue;
        }
        if data.is_empty() {
            let _ = stdin.shutdown().await;
            stdin_open = false;
            continue;
        }
        if stdin.write_all(&data).await.is_err() {
            stdin_open = false;
        }
    }

    // Nobody is left to read the output.
    cancel.cancel();
}

async fn pump_outbound(
    sink: &mut SplitSink<WebSocket, Message>,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    tagged: bool,
) -> Result<(), axum::Error> {
    let mut out_buf = vec![0u8; 8192];
    let mut err_buf = vec![0u8; 8192];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => sink.send(output_frame(StdStream::Stdout, &out_buf[..n], tagged)).await?,
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => sink.send(output_frame(StdStream::Stderr, &err_buf[..n], tagged)).await?,
            },
        }
    }
    Ok(())
}

fn output_frame(stream: StdStream, data: &[u8], tagged: bool) -> Message {
    if !tagged {
        return Message::Binary(Bytes::copy_from_slice(data));
    }
    let mut frame = BytesMut::with_capacity(data.len() + 1);
    frame.put_u8(stream as u8);
    frame.extend_from_slice(data);
    Message::Binary(frame.freeze())
}

/// Parses `resize:<rows>:<cols>`.
fn parse_resize(text: &str) -> Option<WindowSize> {
    let rest = text.strip_prefix("resize:")?;
    let (rows, cols) = rest.split_once(':')?;
    Some(WindowSize::new(cols.trim().parse().ok()?, rows.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resize_control_frames() {
        assert_eq!(parse_resize("resize:24:80"), Some(WindowSize::new(80, 24)));
        assert_eq!(parse_resize("resize:40:120\n"), Some(WindowSize::new(120, 40)));
        assert_eq!(parse_resize("resize:abc:80"), None);
        assert_eq!(parse_resize("ls -la\n"), None);
    }

    #[test]
    fn tagged_output_keeps_raw_bytes() {
        let Message::Binary(frame) = output_frame(StdStream::Stderr, &[0xff, 0xe2, 0x82], true) else {
            panic!("expected a binary frame");
        };
        assert_eq!(&frame[..], &[2, 0xff, 0xe2, 0x82]);

        let Message::Binary(raw) = output_frame(StdStream::Stdout, b"$ ", false) else {
            panic!("expected a binary frame");
        };
        assert_eq!(&raw[..], b"$ ");
    }
}
