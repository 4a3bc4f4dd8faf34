//! Voxcall - Sprachanrufe über einen XMPP-Message-Relay
//!
//! Eine P2P Voice-Call-Applikation mit:
//! - XMPP-artigen Stanzas als einzigem Transport
//! - Anruf-Signalisierung über `open` / `result` / `error`
//! - Opus-Audio (8 kHz, 60 ms Frames) als Base64 in `data`-Stanzas
//! - Echtzeit-Audio über cpal

pub mod call_engine;
pub mod config;
pub mod signaling;

use call_engine::{spawn_frame_sender, AudioError, AudioPipeline, CallEngine, FrameQueues};
use config::{Config, ConfigError};
use crossbeam_channel::{Receiver, Sender};
use signaling::{ChannelSink, SignalingClient, Stanza};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Kapazität der Stanza-Kanäle zum und vom Relay
const STANZA_QUEUE_SIZE: usize = 256;

/// Wie lange [`App::shutdown`] auf den Relay-Client wartet
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (`RUST_LOG` überschreibt die Defaults)
pub fn init_logging(debug: bool) {
    let level = if debug { "voxcall=trace" } else { "voxcall=debug" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Verdrahtet Relay-Client, Call Engine und Audio-Queues
pub struct App {
    engine: Arc<CallEngine>,
    client: Arc<SignalingClient>,
    outgoing_stanzas: Option<mpsc::Receiver<Stanza>>,
    relay_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    incoming_audio: Receiver<Vec<u8>>,
    outgoing_audio_tx: Sender<Vec<u8>>,
    outgoing_audio_rx: Receiver<Vec<u8>>,
    playback_wait: Duration,
}

impl App {
    /// Erstellt den Application State aus einer geprüften Konfiguration
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        tracing::info!("Initializing voxcall as {}...", config.xmpp.user);

        let (sink, outgoing_stanzas) = ChannelSink::new(STANZA_QUEUE_SIZE);
        let queues = FrameQueues::new();

        let engine = Arc::new(CallEngine::new(
            config.engine_config(),
            Arc::new(sink),
            queues.incoming_tx,
            queues.incoming_rx.clone(),
        ));
        let client = Arc::new(SignalingClient::new(config.relay_options()));

        Ok(Self {
            engine,
            client,
            outgoing_stanzas: Some(outgoing_stanzas),
            relay_task: None,
            reader_task: None,
            incoming_audio: queues.incoming_rx,
            outgoing_audio_tx: queues.outgoing_tx,
            outgoing_audio_rx: queues.outgoing_rx,
            playback_wait: config.playback_wait(),
        })
    }

    pub fn engine(&self) -> &Arc<CallEngine> {
        &self.engine
    }

    pub fn client(&self) -> &Arc<SignalingClient> {
        &self.client
    }

    /// Startet Relay-Client und Stanza-Reader
    ///
    /// Gibt `false` zurück, wenn die Signalisierung bereits läuft.
    pub fn start_signaling(&mut self) -> bool {
        let Some(outgoing) = self.outgoing_stanzas.take() else {
            return false;
        };
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Stanza>(STANZA_QUEUE_SIZE);

        let client = Arc::clone(&self.client);
        let relay = tokio::spawn(async move {
            client.run(outgoing, inbound_tx).await;
        });

        let engine = Arc::clone(&self.engine);
        let reader = tokio::spawn(async move {
            while let Some(stanza) = inbound_rx.recv().await {
                engine.handle_stanza(stanza);
            }
            tracing::debug!("Stanza reader stopped");
        });

        self.relay_task = Some(relay);
        self.reader_task = Some(reader);
        true
    }

    /// Stoppt die Signalisierung
    ///
    /// Bereits eingereihte Stanzas (z.B. das Auflegen) werden noch an den
    /// Relay geschrieben, höchstens zwei Sekunden lang.
    pub async fn shutdown(&mut self) {
        self.client.shutdown();

        if let Some(mut relay) = self.relay_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut relay).await.is_err() {
                tracing::warn!("Relay client did not stop in time");
                relay.abort();
            }
        }
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
    }

    /// Startet den Sender-Thread für Audio-Frames
    pub fn start_frame_sender(&self) -> std::io::Result<std::thread::JoinHandle<()>> {
        spawn_frame_sender(Arc::clone(&self.engine), self.outgoing_audio_rx.clone())
    }

    /// Baut die Audio-Pipeline für das Audio-Gerät
    pub fn audio_pipeline(&self) -> Result<AudioPipeline, AudioError> {
        AudioPipeline::new(
            self.incoming_audio.clone(),
            self.outgoing_audio_tx.clone(),
            self.playback_wait,
        )
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("engine", &self.engine)
            .field("client", &self.client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_requires_valid_jid() {
        let config = Config::default();
        assert!(matches!(App::new(&config), Err(ConfigError::InvalidJid(_))));
    }

    fn config(relay_url: String) -> Config {
        let mut config = Config::default();
        config.xmpp.user = "alice@example.org".to_string();
        config.xmpp.relay_url = Some(relay_url);
        config
    }

    #[tokio::test]
    async fn test_signaling_starts_once() {
        let mut app = App::new(&config("ws://127.0.0.1:9/ws".to_string())).unwrap();
        assert!(app.start_signaling());
        assert!(!app.start_signaling());

        // Relay nicht erreichbar: shutdown unterbricht das Retry-Warten
        app.shutdown().await;
        assert!(app.relay_task.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_hang_up() {
        use futures::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => received.push(text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            received
        });

        let mut app = App::new(&config(format!("ws://{}/ws", addr))).unwrap();
        assert!(app.start_signaling());
        app.engine().session().set("bob@example.org");
        app.engine().hang_up().unwrap();
        app.shutdown().await;

        let received = tokio::time::timeout(SHUTDOWN_GRACE, relay)
            .await
            .unwrap()
            .unwrap();
        assert!(received[0].starts_with("<presence"));
        assert!(received
            .iter()
            .any(|text| text.contains(r#"type="error""#) && text.contains("bob@example.org")));
    }
}
