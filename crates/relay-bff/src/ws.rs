use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use relay_core::{AgentClient, OutboundEvent};
use tracing::{info, warn};

use crate::routes::{AppState, ChatRequest};

const DEFAULT_WS_SESSION: &str = "ws-session";
/// Close code for a message whose data does not match its type.
const CLOSE_INVALID_PAYLOAD: u16 = 1007;

pub(crate) async fn ws_chat(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.client))
}

/// One chat turn read off the socket.
#[derive(Debug, PartialEq, Eq)]
struct Turn {
    prompt: String,
    session_id: String,
    actor_id: String,
}

/// Decodes a text message. The session id sticks for the rest of the socket
/// once set.
fn next_turn(text: &str, sticky_session: &mut Option<String>) -> Result<Turn, serde_json::Error> {
    let request: ChatRequest = serde_json::from_str(text)?;
    let session_id = request
        .session_id
        .clone()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| sticky_session.clone())
        .unwrap_or_else(|| DEFAULT_WS_SESSION.to_string());
    *sticky_session = Some(session_id.clone());
    Ok(Turn {
        actor_id: request.actor_id().to_string(),
        prompt: request.message,
        session_id,
    })
}

fn invalid_message_close(err: &serde_json::Error) -> CloseFrame {
    CloseFrame {
        code: CLOSE_INVALID_PAYLOAD,
        reason: err.to_string().into(),
    }
}

async fn handle_socket(mut socket: WebSocket, client: AgentClient) {
    let mut session_id: Option<String> = None;
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let turn = match next_turn(text.as_str(), &mut session_id) {
            Ok(turn) => turn,
            Err(err) => {
                warn!(error = %err, "invalid websocket message");
                let _ = socket.send(Message::Close(Some(invalid_message_close(&err)))).await;
                return;
            }
        };

        let mut relay = match client.invoke_stream(&turn.prompt, &turn.session_id, &turn.actor_id) {
            Ok(relay) => relay,
            Err(err) => {
                let frame = OutboundEvent::error(err.to_string()).to_sse();
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
                continue;
            }
        };
        while let Some(event) = relay.next_event().await {
            if socket.send(Message::Text(event.to_sse().into())).await.is_err() {
                info!(session_id = %turn.session_id, "websocket client went away mid-stream");
                relay.close().await;
                return;
            }
        }
        relay.close().await;
    }
    info!(session_id = session_id.as_deref().unwrap_or(DEFAULT_WS_SESSION), "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_turn_defaults_session() {
        let mut sticky = None;
        let turn = next_turn(r#"{"message":"hi"}"#, &mut sticky).expect("turn");
        assert_eq!(
            turn,
            Turn {
                prompt: "hi".into(),
                session_id: "ws-session".into(),
                actor_id: "default".into(),
            }
        );
    }

    #[test]
    fn session_sticks_across_turns() {
        let mut sticky = None;
        next_turn(r#"{"message":"a","session_id":"abc","actor_id":"u1"}"#, &mut sticky)
            .expect("turn");
        let second = next_turn(r#"{"message":"b"}"#, &mut sticky).expect("turn");
        assert_eq!(second.session_id, "abc");
        assert_eq!(second.actor_id, "default");
    }

    #[test]
    fn malformed_message_is_error() {
        let mut sticky = None;
        assert!(next_turn("not json", &mut sticky).is_err());
        assert!(next_turn(r#"{"session_id":"x"}"#, &mut sticky).is_err());
        assert_eq!(sticky, None);
    }

    #[test]
    fn malformed_message_closes_as_invalid_payload() {
        let mut sticky = None;
        let err = next_turn("{\"message\":", &mut sticky).expect_err("truncated json");
        let frame = invalid_message_close(&err);
        assert_eq!(frame.code, 1007);
        assert!(frame.reason.as_str().contains("EOF"));
    }
}
