// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    Connected,
}

/// The message envelope exchanged on the proxy's `/ws` endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WsEnvelope {
    pub fn publish(channel: &str, message: &str) -> Self {
        Self {
            kind: "publish".to_string(),
            channel: Some(channel.to_string()),
            channels: None,
            message: Some(message.to_string()),
        }
    }

    pub fn subscribe(channels: Vec<String>) -> Self {
        Self {
            kind: "subscribe".to_string(),
            channel: None,
            channels: Some(channels),
            message: None,
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self {
            kind: "unsubscribe".to_string(),
            channel: Some(channel.to_string()),
            channels: None,
            message: None,
        }
    }
}

enum WsCommand {
    Send(WsEnvelope),
}

/// Persistent websocket connection to the proxy with automatic reconnect.
///
/// Outgoing envelopes are queued and flushed in connection order; tracked
/// channel subscriptions are re-sent after every reconnect. Reconnect delays
/// double from one second up to a minute and reset after a successful
/// connection. `close` is idempotent.
pub struct WsClient {
    command_tx: mpsc::UnboundedSender<WsCommand>,
    incoming_tx: broadcast::Sender<String>,
    state: Arc<Mutex<WsState>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl WsClient {
    /// Creates the client and spawns its connection task.
    pub fn start(url: Url, access_token: String) -> Arc<WsClient> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (incoming_tx, _) = broadcast::channel(1024);
        let state = Arc::new(Mutex::new(WsState::Disconnected));
        let subscriptions = Arc::new(Mutex::new(HashSet::new()));
        let cancel = CancellationToken::new();

        let client = Arc::new(WsClient {
            command_tx,
            incoming_tx: incoming_tx.clone(),
            state: state.clone(),
            subscriptions: subscriptions.clone(),
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(connection_loop(
            url,
            access_token,
            command_rx,
            incoming_tx,
            state,
            subscriptions,
            cancel,
        ));

        client
    }

    pub fn state(&self) -> WsState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == WsState::Connected
    }

    /// Messages received on subscribed channels, as raw JSON text.
    pub fn messages(&self) -> broadcast::Receiver<String> {
        self.incoming_tx.subscribe()
    }

    pub fn subscribe(&self, channel: &str) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(channel.to_string());
        let _ = self
            .command_tx
            .send(WsCommand::Send(WsEnvelope::subscribe(vec![
                channel.to_string(),
            ])));
    }

    pub fn unsubscribe(&self, channel: &str) {
        self.subscriptions.lock().unwrap().remove(channel);
        let _ = self
            .command_tx
            .send(WsCommand::Send(WsEnvelope::unsubscribe(channel)));
    }

    /// Queues a publish envelope. Returns false when the client was closed.
    pub fn publish(&self, channel: &str, message: &str) -> bool {
        self.command_tx
            .send(WsCommand::Send(WsEnvelope::publish(channel, message)))
            .is_ok()
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    url: Url,
    access_token: String,
    mut command_rx: mpsc::UnboundedReceiver<WsCommand>,
    incoming_tx: broadcast::Sender<String>,
    state: Arc<Mutex<WsState>>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        *state.lock().unwrap() = WsState::Connecting;

        let request = match build_request(&url, &access_token) {
            Ok(request) => request,
            Err(error) => {
                warn!("failed to build websocket request: {error}");
                *state.lock().unwrap() = WsState::Disconnected;
                break;
            }
        };

        match connect_async(request).await {
            Ok((ws_stream, _)) => {
                info!(url = url.as_str(), "websocket connected");
                *state.lock().unwrap() = WsState::Connected;
                delay = INITIAL_RECONNECT_DELAY;

                let (mut write, mut read) = ws_stream.split();

                let tracked: Vec<String> =
                    subscriptions.lock().unwrap().iter().cloned().collect();
                if !tracked.is_empty() {
                    let envelope = WsEnvelope::subscribe(tracked);
                    if let Err(error) = send_envelope(&mut write, &envelope).await {
                        warn!("failed to restore subscriptions: {error}");
                        *state.lock().unwrap() = WsState::Disconnected;
                        continue;
                    }
                }

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = write.send(Message::Close(None)).await;
                            *state.lock().unwrap() = WsState::Disconnected;
                            return;
                        }
                        command = command_rx.recv() => {
                            match command {
                                Some(WsCommand::Send(envelope)) => {
                                    if let Err(error) = send_envelope(&mut write, &envelope).await {
                                        warn!("websocket send failed: {error}");
                                        break;
                                    }
                                }
                                None => {
                                    let _ = write.send(Message::Close(None)).await;
                                    *state.lock().unwrap() = WsState::Disconnected;
                                    return;
                                }
                            }
                        }
                        message = read.next() => {
                            match message {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = incoming_tx.send(text.to_string());
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    debug!("websocket closed by peer");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(error)) => {
                                    warn!("websocket read failed: {error}");
                                    break;
                                }
                            }
                        }
                    }
                }

                *state.lock().unwrap() = WsState::Disconnected;
            }
            Err(error) => {
                *state.lock().unwrap() = WsState::Disconnected;
                warn!(
                    url = url.as_str(),
                    "websocket connect failed, retrying in {delay:?}: {error}"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }

    *state.lock().unwrap() = WsState::Disconnected;
}

fn build_request(
    url: &Url,
    access_token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
    let mut request = url
        .to_string()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {access_token}")
            .parse()
            .map_err(|e| format!("{e}"))?,
    );
    Ok(request)
}

async fn send_envelope<S>(
    write: &mut S,
    envelope: &WsEnvelope,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(envelope).expect("envelope serialization cannot fail");
    write.send(Message::text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn publish_envelope_shape() {
        let envelope = WsEnvelope::publish("stream:v1:J1", "{\"type\":\"start\"}");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(json["type"], "publish");
        assert_eq!(json["channel"], "stream:v1:J1");
        assert_eq!(json["message"], "{\"type\":\"start\"}");
        assert!(json.get("channels").is_none());
    }

    #[test]
    fn subscribe_envelope_uses_channel_list() {
        let envelope = WsEnvelope::subscribe(vec!["a".to_string(), "b".to_string()]);
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["channels"], serde_json::json!(["a", "b"]));
        assert!(json.get("channel").is_none());
        assert!(json.get("message").is_none());
    }
}
