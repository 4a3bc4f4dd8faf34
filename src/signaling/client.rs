//! WebSocket Client für den Message-Relay
//!
//! Verwaltet die Verbindung zum Relay:
//! - Verbindungsaufbau mit endlosem Retry
//! - Keepalive-Pings
//! - Stanzas parsen und an die Call Engine weiterleiten
//! - Event-basierte Kommunikation

use super::messages::Stanza;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send stanza: {0}")]
    SendFailed(String),

    #[error("Malformed stanza: {0}")]
    Malformed(String),

    #[error("Unsupported stanza <{0}>")]
    Unsupported(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    reconnects: u32,
}

/// Verbindungsparameter
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub url: String,
    pub jid: String,
    pub password: String,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct SignalingClient {
    options: RelayOptions,
    state: Arc<RwLock<ClientState>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    shutdown: Notify,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(options: RelayOptions) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            options,
            state: Arc::new(RwLock::new(ClientState::default())),
            event_tx,
            shutdown: Notify::new(),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet einmalig mit dem Relay
    pub async fn connect(&self) -> Result<WsStream, SignalingError> {
        tracing::info!("Connecting to relay: {}", self.options.url);

        let mut request = self
            .options
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let credentials = BASE64.encode(format!("{}:{}", self.options.jid, self.options.password));
        let header = HeaderValue::from_str(&format!("Basic {}", credentials))
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (mut ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        // Präsenz melden, damit der Relay uns Stanzas zustellt
        let presence = format!(r#"<presence from="{}"/>"#, self.options.jid);
        ws_stream
            .send(Message::Text(presence))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.set_connected(true);
        Ok(ws_stream)
    }

    /// Beendet [`run`](Self::run), nachdem alle bereits eingereihten
    /// Stanzas geschrieben wurden
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Verbindet mit dem Relay und versucht es nach einem Fehler endlos erneut
    ///
    /// Liefert `None`, wenn währenddessen [`shutdown`](Self::shutdown)
    /// aufgerufen wurde.
    pub async fn connect_with_retry(&self) -> Option<WsStream> {
        loop {
            match self.connect().await {
                Ok(stream) => {
                    let attempts = std::mem::take(&mut self.state.write().reconnects);
                    if attempts > 0 {
                        tracing::info!("Connected to relay after {} failed attempts", attempts);
                    }
                    return Some(stream);
                }
                Err(e) => {
                    self.state.write().reconnects += 1;
                    tracing::warn!(
                        "Error connecting relay: {} (retry in {:?})",
                        e,
                        self.options.reconnect_delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                        _ = self.shutdown.notified() => return None,
                    }
                }
            }
        }
    }

    /// Hauptschleife: Stanzas lesen, ausgehende Stanzas schreiben, Keepalive
    ///
    /// Läuft bis `outgoing` geschlossen wird oder [`shutdown`](Self::shutdown)
    /// die Warteschlange leert. Bei Verbindungsabbruch wird automatisch neu
    /// verbunden.
    pub async fn run(&self, mut outgoing: mpsc::Receiver<Stanza>, inbound: mpsc::Sender<Stanza>) {
        let mut closing = false;
        loop {
            let Some(ws_stream) = self.connect_with_retry().await else {
                tracing::info!("Relay client stopped before connecting");
                return;
            };
            let (mut write, mut read) = ws_stream.split();

            let mut keepalive = tokio::time::interval(self.options.keepalive_interval);
            // Erster Tick feuert sofort
            keepalive.tick().await;

            let stopped = loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text, &inbound).await,
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("WebSocket closed by relay");
                            break false;
                        }
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {}", e);
                            break false;
                        }
                        Some(Ok(_)) => {}
                    },
                    stanza = outgoing.recv() => {
                        let Some(mut stanza) = stanza else {
                            break true;
                        };
                        if stanza.from.is_none() {
                            stanza.from = Some(self.options.jid.clone());
                        }
                        let text = match stanza.to_xml() {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::warn!("Dropping unserializable stanza: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!("Failed to send stanza: {}", e);
                            break false;
                        }
                    }
                    // Keine neuen Stanzas mehr; die eingereihten werden noch geschrieben
                    _ = self.shutdown.notified(), if !closing => {
                        closing = true;
                        outgoing.close();
                    }
                    _ = keepalive.tick() => {
                        let ping = format!(
                            r#"<iq type="get" id="{}"><ping xmlns="urn:xmpp:ping"/></iq>"#,
                            uuid::Uuid::new_v4()
                        );
                        if let Err(e) = write.send(Message::Text(ping)).await {
                            tracing::warn!("Failed to send keepalive: {}", e);
                            break false;
                        }
                    }
                }
            };

            self.set_connected(false);
            if stopped {
                let _ = write.close().await;
                tracing::info!("Relay client stopped");
                return;
            }
            if closing {
                tracing::warn!("Connection lost while shutting down, {} stanzas dropped", outgoing.len());
                return;
            }
            tracing::info!("Connection to relay lost. Reconnecting...");
        }
    }

    async fn handle_text(&self, text: &str, inbound: &mpsc::Sender<Stanza>) {
        match Stanza::from_xml(text) {
            Ok(stanza) => {
                if inbound.send(stanza).await.is_err() {
                    tracing::warn!("Inbound stanza queue closed");
                }
            }
            Err(SignalingError::Unsupported(name)) => {
                tracing::trace!("Ignoring <{}> stanza", name);
            }
            Err(e) => tracing::warn!("Skipping stanza: {}", e),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.state.write().is_connected = connected;
        let event = if connected {
            SignalingEvent::Connected
        } else {
            SignalingEvent::Disconnected
        };
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("url", &self.options.url)
            .field("jid", &self.options.jid)
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> RelayOptions {
        RelayOptions {
            // Port 9 (discard) ist lokal nie offen
            url: "ws://127.0.0.1:9/ws".to_string(),
            jid: "alice@example.org".to_string(),
            password: "secret".to_string(),
            reconnect_delay: Duration::from_millis(10),
            keepalive_interval: Duration::from_secs(900),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        let client = SignalingClient::new(options());
        let mut events = client.subscribe();

        assert!(matches!(
            client.connect().await,
            Err(SignalingError::ConnectionFailed(_))
        ));
        assert!(!client.is_connected());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unparseable_text_is_skipped() {
        let client = SignalingClient::new(options());
        let (tx, mut rx) = mpsc::channel(4);

        client.handle_text("<presence/>", &tx).await;
        client.handle_text("garbage", &tx).await;
        client
            .handle_text(r#"<message to="a@b" id="9" type="result"/>"#, &tx)
            .await;

        let stanza = rx.try_recv().unwrap();
        assert_eq!(stanza.id, "9");
        assert!(rx.try_recv().is_err());
    }
}
