//! Chat WebSocket
//!
//! Full-duplex stream on a single connection. Client sends `{type: auth,
//! token}` then `{type: question, text, conversation_id?}`; the server
//! replies with zero or more `token` frames, exactly one `sources`, at most
//! one `title_update`, and exactly one terminal `done` or `error`. Closing
//! the socket cancels the producer.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mnemos_core::ChatFrame;

use crate::auth;
use crate::state::AppState;

/// Client → server frames
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Auth { token: String },
    Question {
        text: String,
        conversation_id: Option<String>,
    },
}

/// WebSocket upgrade handler: GET /api/chat/ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &ChatFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    debug!("chat client connected");

    // First frame must authenticate
    let mut authed = false;
    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = send_frame(
                    &mut socket,
                    &ChatFrame::Error {
                        message: "malformed frame".to_string(),
                    },
                )
                .await;
                continue;
            }
        };

        match frame {
            ClientFrame::Auth { token } => {
                if auth::verify_access(&state.storage, &token).is_ok() {
                    authed = true;
                } else {
                    let _ = send_frame(
                        &mut socket,
                        &ChatFrame::Error {
                            message: "authentication required".to_string(),
                        },
                    )
                    .await;
                    return;
                }
            }
            ClientFrame::Question { text, conversation_id } => {
                if !authed {
                    let _ = send_frame(
                        &mut socket,
                        &ChatFrame::Error {
                            message: "authentication required".to_string(),
                        },
                    )
                    .await;
                    return;
                }
                answer_question(&mut socket, &state, conversation_id, &text).await;
            }
        }
    }

    debug!("chat client disconnected");
}

async fn answer_question(
    socket: &mut WebSocket,
    state: &AppState,
    conversation_id: Option<String>,
    question: &str,
) {
    let (tx, mut rx) = mpsc::channel::<ChatFrame>(64);
    let chat = state.chat.clone();
    let question = question.to_string();
    let producer = tokio::spawn(async move {
        // The engine terminates the stream itself (done or error)
        let _ = chat.answer(conversation_id, &question, tx).await;
    });

    while let Some(frame) = rx.recv().await {
        if !send_frame(socket, &frame).await {
            // Transport gone: dropping rx closes the channel and the
            // producer's next send cancels it
            warn!("chat transport closed mid-stream");
            break;
        }
    }
    producer.abort();
}
