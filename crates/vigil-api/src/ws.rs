//! WebSocket subscription gateway.
//!
//! Each connection owns a set of bus subscriptions, mutated by text commands
//! and torn down on disconnect. Events are serialised as JSON text frames in
//! per-device order; a session that falls behind loses its oldest events and
//! the shared drop counter advances.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamMap;
use tracing::{debug, warn};
use vigil_domain::BusEvent;

/// Subscription commands accepted on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    SubscribeDevice(String),
    UnsubscribeDevice(String),
    SubscribeFirehose,
    UnsubscribeFirehose,
}

pub(crate) fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    match text {
        "subscribe:firehose" => return Some(Command::SubscribeFirehose),
        "unsubscribe:firehose" => return Some(Command::UnsubscribeFirehose),
        _ => {}
    }
    if let Some(id) = text.strip_prefix("subscribe:device ") {
        let id = id.trim();
        if !id.is_empty() {
            return Some(Command::SubscribeDevice(id.to_string()));
        }
    }
    if let Some(id) = text.strip_prefix("unsubscribe:device ") {
        let id = id.trim();
        if !id.is_empty() {
            return Some(Command::UnsubscribeDevice(id.to_string()));
        }
    }
    None
}

const FIREHOSE_KEY: &str = "*";

fn topic_key(device_id: &str) -> String {
    format!("device:{}", device_id)
}

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    let (mut outbound, mut inbound) = socket.split();
    let mut subscriptions: StreamMap<String, BroadcastStream<BusEvent>> = StreamMap::new();

    loop {
        tokio::select! {
            frame = inbound.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        apply_command(text.as_str(), &mut subscriptions, &state);
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            Some((_, event)) = subscriptions.next(), if !subscriptions.is_empty() => {
                match event {
                    Ok(event) => {
                        let frame = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialise bus event");
                                continue;
                            }
                        };
                        if outbound.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        state.bus.note_dropped(skipped);
                        debug!(skipped, "subscriber lagged, oldest events dropped");
                    }
                }
            }
        }
    }

    // Dropping the StreamMap tears down every subscription.
    debug!("subscription session closed");
}

fn apply_command(
    text: &str,
    subscriptions: &mut StreamMap<String, BroadcastStream<BusEvent>>,
    state: &AppState,
) {
    match parse_command(text) {
        Some(Command::SubscribeDevice(device_id)) => {
            let receiver = state.bus.subscribe_device(&device_id);
            subscriptions.insert(topic_key(&device_id), BroadcastStream::new(receiver));
            debug!(device_id = %device_id, "session subscribed to device");
        }
        Some(Command::UnsubscribeDevice(device_id)) => {
            subscriptions.remove(&topic_key(&device_id));
            debug!(device_id = %device_id, "session unsubscribed from device");
        }
        Some(Command::SubscribeFirehose) => {
            let receiver = state.bus.subscribe_firehose();
            subscriptions.insert(FIREHOSE_KEY.to_string(), BroadcastStream::new(receiver));
            debug!("session subscribed to firehose");
        }
        Some(Command::UnsubscribeFirehose) => {
            subscriptions.remove(FIREHOSE_KEY);
        }
        None => {
            debug!(command = %text, "ignoring unknown subscription command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_device() {
        assert_eq!(
            parse_command("subscribe:device dev-1"),
            Some(Command::SubscribeDevice("dev-1".to_string()))
        );
    }

    #[test]
    fn test_parse_unsubscribe_device_trims_whitespace() {
        assert_eq!(
            parse_command("unsubscribe:device  dev-1 "),
            Some(Command::UnsubscribeDevice("dev-1".to_string()))
        );
    }

    #[test]
    fn test_parse_firehose_commands() {
        assert_eq!(
            parse_command("subscribe:firehose"),
            Some(Command::SubscribeFirehose)
        );
        assert_eq!(
            parse_command("unsubscribe:firehose"),
            Some(Command::UnsubscribeFirehose)
        );
    }

    #[test]
    fn test_parse_rejects_malformed_commands() {
        assert_eq!(parse_command("subscribe:device "), None);
        assert_eq!(parse_command("subscribe"), None);
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("publish:device dev-1"), None);
    }
}
