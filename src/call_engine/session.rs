//! Aktuelle Gegenstelle eines aktiven Anrufs

use crate::signaling::bare_jid;
use parking_lot::Mutex;

/// Hält die JID der aktuellen Gegenstelle
///
/// `None` heißt: kein aktiver Anruf. Der Lock wird nur für einzelne
/// Lese- oder Schreibzugriffe gehalten, nie über ein Senden hinweg.
#[derive(Debug, Default)]
pub struct Session {
    remote_peer: Mutex<Option<String>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gibt die aktuelle Gegenstelle zurück
    pub fn remote_peer(&self) -> Option<String> {
        self.remote_peer.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.remote_peer.lock().is_some()
    }

    /// Setzt die Gegenstelle und gibt die vorherige zurück
    pub fn set(&self, peer: impl Into<String>) -> Option<String> {
        self.remote_peer.lock().replace(peer.into())
    }

    /// Beendet den Anruf unabhängig von der Gegenstelle
    pub fn clear(&self) -> Option<String> {
        self.remote_peer.lock().take()
    }

    /// Beendet den Anruf nur, wenn `peer` (als bare JID) die aktuelle Gegenstelle ist
    pub fn clear_if(&self, peer: &str) -> Option<String> {
        let mut remote = self.remote_peer.lock();
        match remote.as_deref() {
            Some(current) if bare_jid(current) == bare_jid(peer) => remote.take(),
            _ => None,
        }
    }

    /// Prüft, ob `peer` (als bare JID) die aktuelle Gegenstelle ist
    pub fn is_remote(&self, peer: &str) -> bool {
        self.remote_peer
            .lock()
            .as_deref()
            .is_some_and(|current| bare_jid(current) == bare_jid(peer))
    }
}
