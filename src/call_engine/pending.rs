//! Registry für laufende Anruf-Verhandlungen
//!
//! Jede `open`-Stanza (gesendet oder empfangen) erzeugt einen
//! [`PendingCall`], der bis zur Annahme, Ablehnung oder zum Timeout lebt.
//! Alle Zugriffe laufen unter einem Lock und sind O(1).

use super::engine::CallError;
use crate::signaling::Stanza;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

/// Ergebnis einer Verhandlung: Antwort-Stanza oder Fehler
pub type CallOutcome = Result<Stanza, CallError>;

/// Richtung einer Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// Wir haben `open` gesendet
    Outgoing,
    /// Wir haben `open` empfangen
    Incoming,
}

/// Eine laufende Verhandlung
#[derive(Debug)]
pub struct PendingCall {
    pub request_id: String,
    pub request: Stanza,
    pub response: Option<Stanza>,
    pub direction: CallDirection,
    pub created_at: Instant,
    done: Option<oneshot::Sender<CallOutcome>>,
}

impl PendingCall {
    /// Gegenstelle der Verhandlung
    pub fn peer(&self) -> &str {
        match self.direction {
            CallDirection::Outgoing => &self.request.to,
            CallDirection::Incoming => self.request.sender(),
        }
    }

    /// Feuert das Done-Signal genau einmal
    fn complete(&mut self, outcome: CallOutcome) {
        if let Ok(response) = &outcome {
            self.response = Some(response.clone());
        }
        if let Some(done) = self.done.take() {
            // Empfänger kann bereits weg sein (eingehende Anrufe, Timeout)
            let _ = done.send(outcome);
        }
    }
}

/// Thread-sichere Zuordnung Request-ID -> [`PendingCall`]
#[derive(Debug, Default)]
pub struct PendingCallRegistry {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registriert eine Verhandlung unter der ID der Stanza
    ///
    /// Ein bestehender Eintrag mit gleicher ID wird ersetzt; dessen
    /// Wartender erhält einen geschlossenen Kanal.
    pub fn push(&self, request: Stanza, direction: CallDirection) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            request_id: request.id.clone(),
            request,
            response: None,
            direction,
            created_at: Instant::now(),
            done: Some(tx),
        };

        if let Some(previous) = self.calls.lock().insert(call.request_id.clone(), call) {
            tracing::warn!("Replacing pending call {}", previous.request_id);
        }
        rx
    }

    /// Entfernt die Verhandlung ohne das Done-Signal zu feuern
    pub fn pop(&self, request_id: &str) -> Option<PendingCall> {
        self.calls.lock().remove(request_id)
    }

    /// Entfernt die Verhandlung nur, wenn sie die gegebene Richtung hat
    pub fn pop_direction(&self, request_id: &str, direction: CallDirection) -> Option<PendingCall> {
        let mut calls = self.calls.lock();
        match calls.get(request_id) {
            Some(call) if call.direction == direction => calls.remove(request_id),
            _ => None,
        }
    }

    /// Entfernt die Verhandlung und feuert ihr Done-Signal
    ///
    /// Für eine unbekannte (oder bereits aufgelöste) ID ist das ein No-op.
    pub fn resolve(&self, request_id: &str, outcome: CallOutcome) -> Option<PendingCall> {
        let mut calls = self.calls.lock();
        let mut call = calls.remove(request_id)?;
        // Senden unter dem Lock: wer danach `pop` ohne Treffer sieht,
        // findet das Ergebnis garantiert im Kanal
        call.complete(outcome);
        Some(call)
    }

    /// Wie [`resolve`](Self::resolve), aber nur für Verhandlungen der gegebenen Richtung
    pub fn resolve_direction(
        &self,
        request_id: &str,
        direction: CallDirection,
        outcome: CallOutcome,
    ) -> Option<PendingCall> {
        let mut calls = self.calls.lock();
        if calls.get(request_id)?.direction != direction {
            return None;
        }
        let mut call = calls.remove(request_id)?;
        call.complete(outcome);
        Some(call)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.calls.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Gegenstelle und ID der ältesten Verhandlung einer Richtung
    pub fn oldest(&self, direction: CallDirection) -> Option<(String, String)> {
        self.calls
            .lock()
            .values()
            .filter(|call| call.direction == direction)
            .min_by_key(|call| call.created_at)
            .map(|call| (call.peer().to_string(), call.request_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::StanzaKind;

    fn open(id: &str) -> Stanza {
        Stanza::new(
            "bob@example.org",
            id,
            StanzaKind::Open {
                block_size: 480,
                sid: id.to_string(),
            },
        )
    }

    #[test]
    fn test_push_then_pop_once() {
        let registry = PendingCallRegistry::new();
        let _rx = registry.push(open("42"), CallDirection::Outgoing);

        let call = registry.pop("42").unwrap();
        assert_eq!(call.request_id, "42");
        assert_eq!(call.peer(), "bob@example.org");
        assert!(registry.pop("42").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_fires_done_exactly_once() {
        let registry = PendingCallRegistry::new();
        let mut rx = registry.push(open("7"), CallDirection::Outgoing);

        let response = Stanza::new("alice@example.org", "7", StanzaKind::Result);
        let resolved = registry.resolve("7", Ok(response.clone())).unwrap();
        assert_eq!(resolved.response, Some(response.clone()));

        // Zweite Auflösung ist ein No-op
        assert!(registry.resolve("7", Err(CallError::Rejected)).is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap(), response);
    }

    #[test]
    fn test_resolve_unknown_id_is_noop() {
        let registry = PendingCallRegistry::new();
        assert!(registry.resolve("missing", Err(CallError::Cancelled)).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_resolve_without_receiver_does_not_panic() {
        let registry = PendingCallRegistry::new();
        drop(registry.push(open("1"), CallDirection::Incoming));
        assert!(registry.resolve("1", Err(CallError::Rejected)).is_some());
    }

    #[test]
    fn test_pop_direction_filters() {
        let registry = PendingCallRegistry::new();
        let _rx = registry.push(open("1"), CallDirection::Outgoing);

        assert!(registry.pop_direction("1", CallDirection::Incoming).is_none());
        assert!(registry.contains("1"));
        assert!(registry.pop_direction("1", CallDirection::Outgoing).is_some());
    }

    #[test]
    fn test_resolve_direction_leaves_other_direction_alone() {
        let registry = PendingCallRegistry::new();
        let mut rx = registry.push(open("5"), CallDirection::Incoming);

        let response = Stanza::new("alice@example.org", "5", StanzaKind::Result);
        assert!(registry
            .resolve_direction("5", CallDirection::Outgoing, Ok(response))
            .is_none());
        assert!(registry.contains("5"));
        assert!(rx.try_recv().is_err());

        assert!(registry
            .resolve_direction("5", CallDirection::Incoming, Err(CallError::Rejected))
            .is_some());
        assert!(matches!(rx.try_recv().unwrap(), Err(CallError::Rejected)));
    }

    #[test]
    fn test_concurrent_resolution_completes_once() {
        use std::sync::Arc;

        let registry = Arc::new(PendingCallRegistry::new());
        let mut rx = registry.push(open("race"), CallDirection::Outgoing);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .resolve("race", Err(CallError::Cancelled))
                        .is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!(matches!(rx.try_recv().unwrap(), Err(CallError::Cancelled)));
    }
}
