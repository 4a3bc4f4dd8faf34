//! Signaling Module - Stanza-Transport über den Message-Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - Stanzas als XML serialisieren und parsen
//! - WebSocket-Verbindung aufbauen und halten
//! - Ausgehende Stanzas non-blocking entgegennehmen
//!

mod client;
mod messages;
mod transport;

pub use client::{RelayOptions, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use transport::{ChannelSink, StanzaSink};
