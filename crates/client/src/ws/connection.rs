//! Push-channel connection manager with auto-reconnect.
//!
//! Owns the single WebSocket connection to the server. Inbound frames are
//! decoded into the `{type, payload}` envelope and dispatched through the
//! topic registry; status transitions are published on the `status` topic.
//! Unexpected closes reconnect with bounded exponential backoff; an
//! explicit disconnect, or a missing credential, never reconnects.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use jamroom_shared::{Envelope, NORMAL_CLOSURE};

use super::registry::{Registry, Subscription, Topic};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Configuration for auto-reconnect behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnect attempts after an unexpected close.
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt, in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the n-th reconnect attempt (1-based): doubles on each
    /// consecutive failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Payload published on the `status` topic at every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Reconnect attempt number, when the transition belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Set when the manager will not try again on its own.
    #[serde(default)]
    pub terminal: bool,
}

impl StatusEvent {
    fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            close_code: None,
            reason: None,
            attempt: None,
            terminal: false,
        }
    }
}

type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

enum Outbound {
    Frame(String),
    Close,
}

/// Handle to the managed connection. Cheap to clone; all clones share the
/// same underlying channel.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

struct ConnShared {
    /// Push-channel URL without the credential query parameter.
    ws_url: String,
    reconnect: ReconnectConfig,
    /// Re-evaluated on every dial so a rotated credential is picked up.
    token_provider: TokenProvider,
    registry: Registry,
    status: Mutex<ConnectionStatus>,
    attempts: AtomicU32,
    explicit_disconnect: AtomicBool,
    /// Bumped by connect/disconnect; a driver whose generation is stale
    /// stops scheduling.
    generation: AtomicU64,
    outbound: Mutex<Option<UnboundedSender<Outbound>>>,
}

impl Connection {
    pub fn new(
        ws_url: impl Into<String>,
        reconnect: ReconnectConfig,
        token_provider: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(ConnShared {
                ws_url: ws_url.into(),
                reconnect,
                token_provider: Arc::new(token_provider),
                registry: Registry::new(),
                status: Mutex::new(ConnectionStatus::Disconnected),
                attempts: AtomicU32::new(0),
                explicit_disconnect: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                outbound: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self
            .shared
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler for a message topic.
    pub fn subscribe(
        &self,
        topic: Topic,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.registry.subscribe(topic, handler)
    }

    /// Open the channel. No-op while already connected or connecting. A
    /// missing credential is fatal: status becomes `Error` and no dial is
    /// attempted.
    pub fn connect(&self) {
        {
            let status = self
                .shared
                .status
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if matches!(
                *status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            ) {
                return;
            }
        }

        if (self.shared.token_provider)().is_none() {
            warn!("connect requested without a credential; not opening a channel");
            self.shared.set_status(ConnectionStatus::Error);
            self.shared.publish_status(StatusEvent {
                reason: Some("missing credential".to_string()),
                terminal: true,
                ..StatusEvent::new(ConnectionStatus::Error)
            });
            return;
        }

        self.shared.explicit_disconnect.store(false, Ordering::SeqCst);
        self.shared.attempts.store(0, Ordering::SeqCst);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.shared.set_status(ConnectionStatus::Connecting);
        self.shared
            .publish_status(StatusEvent::new(ConnectionStatus::Connecting));

        let shared = self.shared.clone();
        tokio::spawn(async move { drive(shared, generation).await });
    }

    /// Close the channel with a normal-closure code and suppress any
    /// scheduled reconnection.
    pub fn disconnect(&self) {
        self.shared.explicit_disconnect.store(true, Ordering::SeqCst);
        self.shared
            .attempts
            .store(self.shared.reconnect.max_attempts, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let sender = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match sender {
            Some(tx) => {
                // The driver sends the close frame and publishes the
                // resulting status transition.
                let _ = tx.unbounded_send(Outbound::Close);
            }
            None => {
                if self.shared.set_status(ConnectionStatus::Disconnected) {
                    self.shared.publish_status(StatusEvent {
                        reason: Some("client disconnect".to_string()),
                        ..StatusEvent::new(ConnectionStatus::Disconnected)
                    });
                }
            }
        }
    }

    /// Serialize `{type, payload}` and transmit it. Returns whether the
    /// frame was handed to the transport; never panics.
    pub fn send(&self, kind: &str, payload: Value) -> bool {
        if self.status() != ConnectionStatus::Connected {
            return false;
        }
        let Ok(text) = serde_json::to_string(&Envelope::new(kind, payload)) else {
            return false;
        };
        let sender = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match sender {
            Some(tx) => tx.unbounded_send(Outbound::Frame(text)).is_ok(),
            None => false,
        }
    }

    /// Reconnect attempts consumed since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

impl ConnShared {
    /// Returns whether the status actually changed.
    fn set_status(&self, next: ConnectionStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == next {
            false
        } else {
            *status = next;
            true
        }
    }

    fn publish_status(&self, event: StatusEvent) {
        if let Ok(payload) = serde_json::to_value(&event) {
            self.registry.publish(&Topic::Status, &payload);
        }
    }

    fn stopped(&self, generation: u64) -> bool {
        self.explicit_disconnect.load(Ordering::SeqCst)
            || self.generation.load(Ordering::SeqCst) != generation
    }
}

/// Connection driver: dial, pump one session, then schedule reconnects
/// until told to stop or the attempt budget runs out.
async fn drive(shared: Arc<ConnShared>, generation: u64) {
    loop {
        if shared.stopped(generation) {
            return;
        }

        let Some(token) = (shared.token_provider)() else {
            // Credential disappeared between reconnects: fatal, same as an
            // unauthenticated connect.
            warn!("credential no longer available; abandoning reconnection");
            shared.set_status(ConnectionStatus::Error);
            shared.publish_status(StatusEvent {
                reason: Some("missing credential".to_string()),
                terminal: true,
                ..StatusEvent::new(ConnectionStatus::Error)
            });
            return;
        };

        let url = format!("{}?token={}", shared.ws_url, urlencoding::encode(&token));
        match connect_async(&url).await {
            Ok((stream, _response)) => {
                if shared.stopped(generation) {
                    // Disconnected while the dial was in flight; drop the
                    // fresh stream without ever announcing it.
                    return;
                }
                let (tx, rx): (UnboundedSender<Outbound>, UnboundedReceiver<Outbound>) =
                    unbounded();
                *shared
                    .outbound
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(tx);
                shared.attempts.store(0, Ordering::SeqCst);
                shared.set_status(ConnectionStatus::Connected);
                shared.publish_status(StatusEvent::new(ConnectionStatus::Connected));
                info!(url = %shared.ws_url, "channel connected");

                let close = run_session(&shared, stream, rx).await;

                *shared
                    .outbound
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = None;
                shared.set_status(ConnectionStatus::Disconnected);
                info!(code = ?close.code, "channel closed");
                shared.publish_status(StatusEvent {
                    close_code: close.code,
                    reason: close.reason,
                    ..StatusEvent::new(ConnectionStatus::Disconnected)
                });
            }
            Err(e) => {
                warn!(error = %e, "channel dial failed");
                shared.set_status(ConnectionStatus::Error);
                shared.publish_status(StatusEvent {
                    reason: Some(e.to_string()),
                    ..StatusEvent::new(ConnectionStatus::Error)
                });
                // A failed dial has no close frame; fall through to
                // scheduling as if the channel had closed.
                shared.set_status(ConnectionStatus::Disconnected);
            }
        }

        if shared.stopped(generation) {
            return;
        }
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > shared.reconnect.max_attempts {
            warn!(
                max_attempts = shared.reconnect.max_attempts,
                "reconnect attempts exhausted; giving up"
            );
            shared.publish_status(StatusEvent {
                terminal: true,
                ..StatusEvent::new(ConnectionStatus::Disconnected)
            });
            return;
        }

        let delay = shared.reconnect.delay_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::time::sleep(delay).await;
        if shared.stopped(generation) {
            return;
        }
        shared.set_status(ConnectionStatus::Connecting);
        shared.publish_status(StatusEvent {
            attempt: Some(attempt),
            ..StatusEvent::new(ConnectionStatus::Connecting)
        });
    }
}

struct CloseInfo {
    code: Option<u16>,
    reason: Option<String>,
}

/// Pump one established session until it closes; returns what is known
/// about the close.
async fn run_session(
    shared: &Arc<ConnShared>,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx: UnboundedReceiver<Outbound>,
) -> CloseInfo {
    let (mut write, mut read) = stream.split();

    let mut close = CloseInfo {
        code: None,
        reason: None,
    };

    loop {
        tokio::select! {
            out = rx.next() => match out {
                Some(Outbound::Frame(text)) => {
                    debug!(frame = %text, "sending");
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        error!(error = %e, "send failed");
                        shared.set_status(ConnectionStatus::Error);
                        shared.publish_status(StatusEvent {
                            reason: Some(e.to_string()),
                            ..StatusEvent::new(ConnectionStatus::Error)
                        });
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    close.code = Some(NORMAL_CLOSURE);
                    close.reason = Some("client disconnect".to_string());
                    break;
                }
                // Every handle dropped; nothing can send anymore.
                None => break,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch_frame(&shared.registry, text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        close.code = Some(u16::from(frame.code));
                        let reason = frame.reason.to_string();
                        if !reason.is_empty() {
                            close.reason = Some(reason);
                        }
                    }
                    break;
                }
                // Pong responses are handled by tungstenite itself.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "channel transport error");
                    shared.set_status(ConnectionStatus::Error);
                    shared.publish_status(StatusEvent {
                        reason: Some(e.to_string()),
                        ..StatusEvent::new(ConnectionStatus::Error)
                    });
                    break;
                }
                None => break,
            },
        }
    }

    close
}

/// Decode one inbound frame and publish it on its topic. Undecodable
/// frames are dropped after a `message_error` publish; they do not affect
/// connection health.
fn dispatch_frame(registry: &Registry, text: &str) {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => match envelope.kind {
            Some(tag) => registry.publish(&Topic::parse(&tag), &envelope.payload),
            None => registry.publish(&Topic::Untyped, &envelope.payload),
        },
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            registry.publish(
                &Topic::MessageError,
                &serde_json::json!({ "error": e.to_string() }),
            );
        }
    }
}
