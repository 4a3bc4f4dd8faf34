//! Call Engine - Anruf-Zustandsautomat
//!
//! Verarbeitet eingehende Stanzas (open / result / error / data), baut
//! ausgehende Anrufe mit Timeout auf und hält genau eine aktive
//! Gegenstelle. Die Oberfläche hängt sich über [`CallEngine::subscribe`] an.

use super::audio::FRAME_SIZE;
use super::framer;
use super::pending::{CallDirection, PendingCallRegistry};
use super::session::Session;
use crate::signaling::{SignalingError, Stanza, StanzaKind, StanzaSink};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Standard-Timeout für den Verbindungsaufbau
pub const CALL_TIMEOUT: Duration = Duration::from_secs(25);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Request timeout")]
    Timeout,

    #[error("Call was rejected")]
    Rejected,

    #[error("Call was cancelled")]
    Cancelled,

    #[error("No active call")]
    NoActiveCall,

    #[error("Unknown call request: {0}")]
    UnknownRequest(String),

    #[error("Transport error: {0}")]
    Transport(#[from] SignalingError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status, abgeleitet aus Session und offenen Verhandlungen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf wartet auf Antwort
    CallingOut { peer: String, request_id: String },
    /// Eingehender Anruf wartet auf Annahme oder Ablehnung
    RingingIn { peer: String, request_id: String },
    /// Anruf aktiv
    Active { peer: String },
}

/// Warum ein Anruf endete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    Rejected,
    Timeout,
    Aborted,
    Failed,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            EndReason::LocalHangUp => "hung up",
            EndReason::RemoteHangUp => "remote hung up",
            EndReason::Rejected => "rejected",
            EndReason::Timeout => "no answer",
            EndReason::Aborted => "cancelled",
            EndReason::Failed => "failed",
        };
        f.write_str(text)
    }
}

impl From<&CallError> for EndReason {
    fn from(err: &CallError) -> Self {
        match err {
            CallError::Timeout => EndReason::Timeout,
            CallError::Rejected => EndReason::Rejected,
            CallError::Cancelled => EndReason::Aborted,
            _ => EndReason::Failed,
        }
    }
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Calling { peer: String, request_id: String },
    IncomingCall { peer: String, request_id: String },
    /// Eingehender Anruf vom Anrufer zurückgezogen oder abgelaufen
    IncomingCallWithdrawn { peer: String, request_id: String },
    CallActive { peer: String },
    CallEnded { peer: String, reason: EndReason },
    ChatMessage {
        peer: String,
        text: String,
        received_at: DateTime<Utc>,
    },
}

// ============================================================================
// CALL ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Eigene JID (Absender ausgehender Stanzas)
    pub local_jid: String,
    pub setup_timeout: Duration,
}

impl EngineConfig {
    pub fn new(local_jid: impl Into<String>) -> Self {
        Self {
            local_jid: local_jid.into(),
            setup_timeout: CALL_TIMEOUT,
        }
    }
}

/// Anruf-Zustandsautomat
pub struct CallEngine {
    config: EngineConfig,
    session: Arc<Session>,
    pending: Arc<PendingCallRegistry>,
    sink: Arc<dyn StanzaSink>,
    incoming: Sender<Vec<u8>>,
    incoming_rx: Receiver<Vec<u8>>,
    event_tx: broadcast::Sender<CallEvent>,
    next_seq: AtomicU32,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    ///
    /// `incoming` / `incoming_rx` sind die beiden Enden des Incoming-Buffers,
    /// aus dem die Audio-Pipeline liest. Die Engine leert ihn am Ende eines
    /// Anrufs.
    pub fn new(
        config: EngineConfig,
        sink: Arc<dyn StanzaSink>,
        incoming: Sender<Vec<u8>>,
        incoming_rx: Receiver<Vec<u8>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            session: Arc::new(Session::new()),
            pending: Arc::new(PendingCallRegistry::new()),
            sink,
            incoming,
            incoming_rx,
            event_tx,
            next_seq: AtomicU32::new(0),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn pending(&self) -> &PendingCallRegistry {
        &self.pending
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        if let Some(peer) = self.session.remote_peer() {
            return CallState::Active { peer };
        }
        if let Some((peer, request_id)) = self.pending.oldest(CallDirection::Outgoing) {
            return CallState::CallingOut { peer, request_id };
        }
        if let Some((peer, request_id)) = self.pending.oldest(CallDirection::Incoming) {
            return CallState::RingingIn { peer, request_id };
        }
        CallState::Idle
    }

    // ========================================================================
    // OUTGOING
    // ========================================================================

    /// Startet einen ausgehenden Anruf und wartet auf Annahme
    ///
    /// Endet mit Annahme, Ablehnung, Abbruch ([`abort_outgoing_call`]) oder
    /// nach dem Setup-Timeout. Mehrere Aufrufe dürfen parallel laufen.
    ///
    /// [`abort_outgoing_call`]: CallEngine::abort_outgoing_call
    pub async fn call(&self, peer: &str) -> Result<(), CallError> {
        let request_id = Uuid::new_v4().to_string();
        let request = self.stanza(
            peer,
            &request_id,
            StanzaKind::Open {
                block_size: FRAME_SIZE as u32,
                sid: request_id.clone(),
            },
        );

        let mut done = self.pending.push(request.clone(), CallDirection::Outgoing);
        self.emit(CallEvent::Calling {
            peer: peer.to_string(),
            request_id: request_id.clone(),
        });

        if let Err(e) = self.sink.send(request) {
            self.pending.pop(&request_id);
            tracing::warn!("Failed to send call request to {}: {}", peer, e);
            self.emit(CallEvent::CallEnded {
                peer: peer.to_string(),
                reason: EndReason::Failed,
            });
            return Err(e.into());
        }

        tracing::info!("Calling {} (timeout {:?})", peer, self.config.setup_timeout);

        let finished = tokio::select! {
            outcome = &mut done => Some(outcome),
            _ = tokio::time::sleep(self.config.setup_timeout) => None,
        };

        let outcome = match finished {
            Some(outcome) => outcome.unwrap_or(Err(CallError::Cancelled)),
            None => match self.pending.pop(&request_id) {
                Some(_) => {
                    self.send_error(peer, &request_id);
                    if self.session.clear_if(peer).is_some() {
                        self.drain_incoming();
                    }
                    Err(CallError::Timeout)
                }
                // Gleichzeitig aufgelöst, Ergebnis liegt bereits im Kanal
                None => done.await.unwrap_or(Err(CallError::Cancelled)),
            },
        };

        match outcome {
            Ok(_) => {
                if let Some(previous) = self.session.set(peer) {
                    tracing::warn!("Replacing active call with {}", previous);
                }
                tracing::info!("Connection with {} established", peer);
                self.emit(CallEvent::CallActive {
                    peer: peer.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::info!("Error connecting {}: {}", peer, e);
                self.emit(CallEvent::CallEnded {
                    peer: peer.to_string(),
                    reason: EndReason::from(&e),
                });
                Err(e)
            }
        }
    }

    /// Bricht einen ausgehenden Anruf ab
    ///
    /// Weckt den wartenden [`call`](CallEngine::call) mit
    /// [`CallError::Cancelled`]. Ist die Verhandlung bereits aufgelöst, passiert
    /// nichts.
    pub fn abort_outgoing_call(&self, request_id: &str) -> Result<(), CallError> {
        let Some(call) = self.pending.resolve_direction(
            request_id,
            CallDirection::Outgoing,
            Err(CallError::Cancelled),
        ) else {
            tracing::debug!("Abort for unknown request {} ignored", request_id);
            return Ok(());
        };

        let peer = call.peer().to_string();
        self.end_call(&peer, EndReason::LocalHangUp);
        self.sink
            .send(self.stanza(&peer, request_id, StanzaKind::Error))?;
        Ok(())
    }

    // ========================================================================
    // INCOMING
    // ========================================================================

    /// Nimmt einen eingehenden Anruf an
    pub fn accept_call(&self, request_id: &str) -> Result<String, CallError> {
        let call = self
            .pending
            .pop_direction(request_id, CallDirection::Incoming)
            .ok_or_else(|| CallError::UnknownRequest(request_id.to_string()))?;
        let peer = call.peer().to_string();

        self.sink
            .send(self.stanza(&peer, request_id, StanzaKind::Result))?;

        // Nur eine Gegenstelle: ein laufender Anruf wird ersetzt
        if let Some(previous) = self.session.set(peer.clone()) {
            tracing::warn!("Replacing active call with {}", previous);
        }
        tracing::info!("Accepted call from {}", peer);
        self.emit(CallEvent::CallActive { peer: peer.clone() });
        Ok(peer)
    }

    /// Lehnt einen eingehenden Anruf ab oder beendet (`None`) den aktiven Anruf
    pub fn reject_call(&self, request_id: Option<&str>) -> Result<(), CallError> {
        let Some(request_id) = request_id else {
            return self.hang_up();
        };

        let call = self
            .pending
            .pop_direction(request_id, CallDirection::Incoming)
            .ok_or_else(|| CallError::UnknownRequest(request_id.to_string()))?;
        let peer = call.peer().to_string();

        tracing::info!("Rejecting call from {}", peer);
        self.end_call(&peer, EndReason::LocalHangUp);
        self.sink
            .send(self.stanza(&peer, request_id, StanzaKind::Error))?;
        Ok(())
    }

    /// Beendet den aktiven Anruf
    pub fn hang_up(&self) -> Result<(), CallError> {
        let peer = self.session.remote_peer().ok_or(CallError::NoActiveCall)?;
        let sent = self.sink.send(self.stanza(
            &peer,
            &Uuid::new_v4().to_string(),
            StanzaKind::Error,
        ));

        // Lokal wird immer aufgelegt, auch wenn das Senden scheitert
        self.end_call(&peer, EndReason::LocalHangUp);
        sent.map_err(CallError::from)
    }

    // ========================================================================
    // STANZA DISPATCH
    // ========================================================================

    /// Verarbeitet eine eingehende Stanza
    pub fn handle_stanza(&self, stanza: Stanza) {
        match &stanza.kind {
            StanzaKind::Chat { body } => {
                self.emit(CallEvent::ChatMessage {
                    peer: stanza.sender().to_string(),
                    text: body.clone(),
                    received_at: Utc::now(),
                });
            }
            StanzaKind::Open { .. } => self.on_open(stanza),
            StanzaKind::Data { .. } => self.on_data(&stanza),
            StanzaKind::Result => {
                tracing::debug!("Call {} accepted by {}", stanza.id, stanza.sender());
                let request_id = stanza.id.clone();
                if self
                    .pending
                    .resolve_direction(&request_id, CallDirection::Outgoing, Ok(stanza))
                    .is_none()
                {
                    tracing::debug!("Result for unknown request ignored");
                }
            }
            StanzaKind::Error => self.on_error(stanza),
            StanzaKind::Close { .. } => {
                tracing::debug!("Ignoring close from {}", stanza.sender());
            }
        }
    }

    fn on_open(&self, stanza: Stanza) {
        let peer = stanza.sender().to_string();
        let request_id = stanza.id.clone();
        if peer.is_empty() || request_id.is_empty() {
            tracing::warn!("Ignoring call request without sender or id");
            return;
        }

        tracing::info!("Incoming call from {} ({})", peer, request_id);
        // Niemand wartet auf eingehende Verhandlungen
        drop(self.pending.push(stanza, CallDirection::Incoming));
        self.emit(CallEvent::IncomingCall {
            peer: peer.clone(),
            request_id: request_id.clone(),
        });

        // Unbeantwortete Anfragen nach dem Setup-Timeout verwerfen
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime, incoming call {} will not expire", request_id);
            return;
        };
        let pending = Arc::clone(&self.pending);
        let event_tx = self.event_tx.clone();
        let timeout = self.config.setup_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if pending
                .pop_direction(&request_id, CallDirection::Incoming)
                .is_some()
            {
                tracing::debug!("Incoming call {} expired", request_id);
                let _ = event_tx.send(CallEvent::IncomingCallWithdrawn { peer, request_id });
            }
        });
    }

    fn on_data(&self, stanza: &Stanza) {
        // Kein Audio von unbestätigten Gegenstellen
        if !self.session.is_remote(stanza.sender()) {
            tracing::trace!("Dropping data from {}", stanza.sender());
            return;
        }

        let frame = match framer::unwrap_data(stanza) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping frame from {}: {}", stanza.sender(), e);
                return;
            }
        };

        match self.incoming.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("Incoming buffer full, frame dropped"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn on_error(&self, stanza: Stanza) {
        let peer = stanza.sender().to_string();

        if let Some(call) = self.pending.resolve(&stanza.id, Err(CallError::Rejected)) {
            if call.direction == CallDirection::Incoming {
                tracing::info!("Caller {} withdrew call {}", peer, stanza.id);
                self.emit(CallEvent::IncomingCallWithdrawn {
                    peer: peer.clone(),
                    request_id: stanza.id.clone(),
                });
            }
        }

        self.end_call(&peer, EndReason::RemoteHangUp);
    }

    // ========================================================================
    // DATA & CHAT
    // ========================================================================

    /// Verschickt einen kodierten Frame an die aktuelle Gegenstelle
    ///
    /// Gibt `false` zurück, wenn kein Anruf aktiv ist und der Frame verworfen
    /// wurde.
    pub fn send_frame(&self, frame: &[u8]) -> Result<bool, CallError> {
        if frame.is_empty() {
            return Ok(false);
        }
        let Some(peer) = self.session.remote_peer() else {
            return Ok(false);
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let stanza = framer::wrap_data(&peer, seq, frame).with_from(self.config.local_jid.clone());
        self.sink.send(stanza)?;
        Ok(true)
    }

    /// Sendet eine Textnachricht
    pub fn send_chat(&self, peer: &str, text: &str) -> Result<(), CallError> {
        let stanza = self.stanza(
            peer,
            &Uuid::new_v4().to_string(),
            StanzaKind::Chat {
                body: text.to_string(),
            },
        );
        self.sink.send(stanza)?;
        Ok(())
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn stanza(&self, to: &str, id: &str, kind: StanzaKind) -> Stanza {
        Stanza::new(to, id, kind).with_from(self.config.local_jid.clone())
    }

    /// Beendet den aktiven Anruf, falls `peer` die Gegenstelle ist
    fn end_call(&self, peer: &str, reason: EndReason) {
        let Some(previous) = self.session.clear_if(peer) else {
            return;
        };
        let dropped = self.drain_incoming();
        tracing::info!(
            "Call with {} ended: {} ({} buffered frames dropped)",
            previous,
            reason,
            dropped
        );
        self.emit(CallEvent::CallEnded {
            peer: previous,
            reason,
        });
    }

    /// Verwirft Frames, die noch vom letzten Anruf im Incoming-Buffer liegen
    fn drain_incoming(&self) -> usize {
        self.incoming_rx.try_iter().count()
    }

    fn send_error(&self, peer: &str, request_id: &str) {
        if let Err(e) = self.sink.send(self.stanza(peer, request_id, StanzaKind::Error)) {
            tracing::warn!("Failed to cancel call {}: {}", request_id, e);
        }
    }

    fn emit(&self, event: CallEvent) {
        // Keine Subscriber ist kein Fehler
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local_jid", &self.config.local_jid)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
