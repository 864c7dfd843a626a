use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{Error, Result, http::HttpClient};

use super::{Node, NodeState};

/// How a single WebSocket session ended.
pub(super) enum SessionOutcome {
    /// Caller-initiated close (disconnect or destroy); never reconnect from here.
    Closed,
    /// The server refused us for good; reconnecting would loop forever.
    Permanent { code: u16, reason: String },
    /// Transient loss; the session loop schedules a reconnect.
    Lost { code: u16, reason: String },
}

/// Close codes that make the session unrecoverable: bad credentials,
/// invalid/duplicated session state, or a server-side shutdown of this client.
pub(super) fn is_permanent_close(code: u16) -> bool {
    matches!(code, 4004 | 4005 | 4006 | 4009 | 4015 | 4016)
}

/// Dial one WebSocket session and pump frames until it ends.
///
/// Frames are handled strictly in receive order; the next frame is not read
/// until the previous one's dispatch finished, which is what keeps
/// server-ordered events server-ordered downstream.
pub(super) async fn run_session(node: &Arc<Node>, cancel: CancellationToken) -> Result<SessionOutcome> {
    let mut request = node.options().ws_url().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&node.options().password)
            .map_err(|_| invalid_header(node, "password"))?,
    );
    let user_id = node.user_id().ok_or(Error::MissingUserId)?;
    headers.insert(
        "User-Id",
        HeaderValue::from_str(&user_id.to_string())
            .map_err(|_| invalid_header(node, "user id"))?,
    );
    headers.insert("Client-Name", HeaderValue::from_static(HttpClient::USER_AGENT));

    // Prefer resuming a concrete session; fall back to announcing the resume
    // key so the server parks the session if we drop.
    if let Some(session_id) = node.session_id() {
        headers.insert(
            "Session-Id",
            HeaderValue::from_str(&session_id.0)
                .map_err(|_| invalid_header(node, "session id"))?,
        );
    } else if let Some(key) = &node.options().resume_key {
        headers.insert(
            "Resume-Key",
            HeaderValue::from_str(key).map_err(|_| invalid_header(node, "resume key"))?,
        );
    }

    debug!("[{}] Dialing {}", node.identifier(), node.options().ws_url());
    let (ws_stream, _) = connect_async(request).await?;
    let (mut write, mut read) = ws_stream.split();

    node.set_state(NodeState::OpenAwaitingReady);
    node.emit_connect();

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Graceful close; terminate regardless of the write result.
                let _ = write.send(Message::Close(None)).await;
                break SessionOutcome::Closed;
            }
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("[{}] WS read error: {}", node.identifier(), e);
                        break SessionOutcome::Lost { code: 1006, reason: format!("IO error: {e}") };
                    }
                    None => {
                        debug!("[{}] WS stream ended", node.identifier());
                        break SessionOutcome::Lost { code: 1006, reason: "Stream ended".into() };
                    }
                };

                match msg {
                    Message::Text(text) => {
                        Arc::clone(node).handle_frame(text.as_str()).await;
                    }
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Message::Close(frame) => {
                        let (code, reason) = frame
                            .map(|cf| (cf.code.into(), cf.reason.to_string()))
                            .unwrap_or((1000u16, "No reason".into()));
                        info!(
                            "[{}] WS closed: code={}, reason='{}'",
                            node.identifier(), code, reason
                        );
                        if is_permanent_close(code) {
                            break SessionOutcome::Permanent { code, reason };
                        }
                        break SessionOutcome::Lost { code, reason };
                    }
                    _ => {}
                }
            }
        }
    };

    Ok(outcome)
}

fn invalid_header(node: &Node, what: &str) -> Error {
    Error::InvalidNodeOptions {
        identifier: node.identifier().to_string(),
        reason: format!("{what} is not a valid header value"),
    }
}
