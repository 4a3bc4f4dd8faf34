//! Sende-Schnittstelle zwischen Call Engine und Relay
//!
//! Die Engine kennt nur [`StanzaSink`]. In Produktion steckt dahinter der
//! Writer-Task des [`SignalingClient`](super::SignalingClient), in Tests ein
//! einfacher Kanal.

use super::client::SignalingError;
use super::messages::Stanza;
use tokio::sync::mpsc;

/// Nimmt ausgehende Stanzas entgegen (non-blocking, best effort)
pub trait StanzaSink: Send + Sync {
    fn send(&self, stanza: Stanza) -> Result<(), SignalingError>;
}

/// [`StanzaSink`] auf Basis eines begrenzten tokio-Kanals
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Stanza>,
}

impl ChannelSink {
    /// Erstellt Sink und zugehörigen Empfänger
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Stanza>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StanzaSink for ChannelSink {
    fn send(&self, stanza: Stanza) -> Result<(), SignalingError> {
        // try_send ist non-blocking
        self.tx.try_send(stanza).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => SignalingError::NotConnected,
            mpsc::error::TrySendError::Full(_) => {
                SignalingError::SendFailed("outgoing stanza queue full".to_string())
            }
        })
    }
}
