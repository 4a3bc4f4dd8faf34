//! Stanza-Typen für das Signaling-Protokoll
//!
//! Alle Nachrichten laufen als XMPP-artige `<message>`-Stanzas über den Relay.
//! Die Anruf-Payloads (`open`, `data`, `close`) liegen im eigenen
//! Namespace [`NS_VOXMPP`], Annahme und Ablehnung werden über den
//! Stanza-Typ (`result` / `error`) signalisiert.

use super::client::SignalingError;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

/// Namespace der Anruf-Payloads
pub const NS_VOXMPP: &str = "http://jabber.org/protocol/ibb/voxmpp";

/// Stanza-Typ für Anruf-Payloads (`open`, `data`, `close`)
const TYPE_VOXMPP: &str = "voxmpp";

// ============================================================================
// STANZA
// ============================================================================

/// Inhalt einer Stanza
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StanzaKind {
    /// Textnachricht
    Chat { body: String },

    /// Anrufanfrage
    Open { block_size: u32, sid: String },

    /// Ein gerahmter Audio-Frame (Base64-Text)
    Data { seq: u32, sid: String, payload: String },

    /// Kanal schließen (im Protokoll definiert, vom Anrufablauf nicht genutzt)
    Close { sid: String },

    /// Anruf angenommen
    Result,

    /// Anruf abgelehnt, abgebrochen oder beendet
    Error,
}

/// Eine Stanza, wie sie über den Relay ausgetauscht wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    /// Korrelations-ID (Request-ID bei `open` / `result` / `error`)
    pub id: String,
    /// Absender, vom Relay gesetzt
    pub from: Option<String>,
    pub to: String,
    pub kind: StanzaKind,
}

impl Stanza {
    pub fn new(to: impl Into<String>, id: impl Into<String>, kind: StanzaKind) -> Self {
        Self {
            id: id.into(),
            from: None,
            to: to.into(),
            kind,
        }
    }

    /// Setzt den Absender
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Absender oder leerer String
    pub fn sender(&self) -> &str {
        self.from.as_deref().unwrap_or_default()
    }

    fn type_attr(&self) -> &'static str {
        match self.kind {
            StanzaKind::Chat { .. } => "chat",
            StanzaKind::Result => "result",
            StanzaKind::Error => "error",
            StanzaKind::Open { .. } | StanzaKind::Data { .. } | StanzaKind::Close { .. } => {
                TYPE_VOXMPP
            }
        }
    }

    // ========================================================================
    // XML
    // ========================================================================

    /// Serialisiert die Stanza als `<message>`-Element
    pub fn to_xml(&self) -> Result<String, SignalingError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        let mut message = BytesStart::new("message");
        message.push_attribute(("to", self.to.as_str()));
        if let Some(from) = &self.from {
            message.push_attribute(("from", from.as_str()));
        }
        message.push_attribute(("id", self.id.as_str()));
        message.push_attribute(("type", self.type_attr()));

        match &self.kind {
            StanzaKind::Result | StanzaKind::Error => {
                write(&mut writer, Event::Empty(message))?;
                return finish(writer);
            }
            _ => write(&mut writer, Event::Start(message))?,
        }

        match &self.kind {
            StanzaKind::Chat { body } => {
                write(&mut writer, Event::Start(BytesStart::new("body")))?;
                write(&mut writer, Event::Text(BytesText::new(body)))?;
                write(&mut writer, Event::End(BytesStart::new("body").to_end()))?;
            }
            StanzaKind::Open { block_size, sid } => {
                let mut open = BytesStart::new("open");
                open.push_attribute(("xmlns", NS_VOXMPP));
                open.push_attribute(("block-size", block_size.to_string().as_str()));
                open.push_attribute(("sid", sid.as_str()));
                write(&mut writer, Event::Empty(open))?;
            }
            StanzaKind::Data { seq, sid, payload } => {
                let mut data = BytesStart::new("data");
                data.push_attribute(("xmlns", NS_VOXMPP));
                data.push_attribute(("seq", seq.to_string().as_str()));
                data.push_attribute(("sid", sid.as_str()));
                write(&mut writer, Event::Start(data))?;
                write(&mut writer, Event::Text(BytesText::new(payload)))?;
                write(&mut writer, Event::End(BytesStart::new("data").to_end()))?;
            }
            StanzaKind::Close { sid } => {
                let mut close = BytesStart::new("close");
                close.push_attribute(("xmlns", NS_VOXMPP));
                close.push_attribute(("sid", sid.as_str()));
                write(&mut writer, Event::Empty(close))?;
            }
            StanzaKind::Result | StanzaKind::Error => {}
        }

        write(&mut writer, Event::End(BytesStart::new("message").to_end()))?;
        finish(writer)
    }

    /// Parst eine `<message>`-Stanza
    ///
    /// Andere Stanzas (`presence`, `iq`) liefern [`SignalingError::Unsupported`],
    /// kaputte oder unbekannte Nachrichten [`SignalingError::Malformed`].
    pub fn from_xml(xml: &str) -> Result<Self, SignalingError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut parser = MessageParser::default();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let capture = parser.element(&e)?;
                    if parser.depth == 1 {
                        parser.capture = capture;
                    }
                    parser.depth += 1;
                }
                Ok(Event::Empty(e)) => {
                    parser.element(&e)?;
                }
                Ok(Event::Text(e)) => {
                    let unescaped = e
                        .unescape()
                        .map_err(|err| SignalingError::Malformed(err.to_string()))?;
                    parser.text(&unescaped);
                }
                Ok(Event::End(_)) => {
                    parser.depth = parser.depth.saturating_sub(1);
                    if parser.depth <= 1 {
                        parser.capture = None;
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(SignalingError::Malformed(e.to_string())),
                _ => {}
            }
        }

        parser.finish()
    }
}

/// Entfernt die Ressource einer JID (`user@host/res` -> `user@host`)
pub fn bare_jid(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

// ============================================================================
// PARSER HELPERS
// ============================================================================

struct MessageHeader {
    to: String,
    from: Option<String>,
    id: String,
    msg_type: String,
}

impl MessageHeader {
    fn parse(e: &BytesStart<'_>) -> Result<Self, SignalingError> {
        let mut header = Self {
            to: String::new(),
            from: None,
            id: String::new(),
            // XMPP default
            msg_type: "normal".to_string(),
        };

        for attr in e.attributes() {
            let attr = attr.map_err(|err| SignalingError::Malformed(err.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|err| SignalingError::Malformed(err.to_string()))?
                .to_string();
            match attr.key.as_ref() {
                b"to" => header.to = value,
                b"from" => header.from = Some(value),
                b"id" => header.id = value,
                b"type" => header.msg_type = value,
                _ => {}
            }
        }

        Ok(header)
    }
}

enum ChildElement {
    Open { block_size: u32, sid: String },
    Data { seq: u32, sid: String },
    Close { sid: String },
    Body,
    Other,
}

impl ChildElement {
    fn parse(e: &BytesStart<'_>) -> Result<Self, SignalingError> {
        let mut namespace = String::new();
        let mut sid = String::new();
        let mut seq = 0u32;
        let mut block_size = 0u32;

        for attr in e.attributes() {
            let attr = attr.map_err(|err| SignalingError::Malformed(err.to_string()))?;
            let value = attr
                .unescape_value()
                .map_err(|err| SignalingError::Malformed(err.to_string()))?;
            match attr.key.as_ref() {
                b"xmlns" => namespace = value.to_string(),
                b"sid" => sid = value.to_string(),
                b"seq" => seq = value.parse().unwrap_or_default(),
                b"block-size" => block_size = value.parse().unwrap_or_default(),
                _ => {}
            }
        }

        let name = e.local_name();
        if name.as_ref() == b"body" {
            return Ok(Self::Body);
        }
        if namespace != NS_VOXMPP {
            return Ok(Self::Other);
        }

        Ok(match name.as_ref() {
            b"open" => Self::Open { block_size, sid },
            b"data" => Self::Data { seq, sid },
            b"close" => Self::Close { sid },
            _ => Self::Other,
        })
    }
}

/// Element, dessen Text gerade gesammelt wird
#[derive(Debug, Clone, Copy)]
enum Capture {
    Body,
    Data,
}

/// Zustand beim Lesen einer `<message>`
///
/// Ausgewertet werden der erste `<body>` und das erste Kind im
/// voxmpp-Namespace. Fremde Kinder (`<thread>`, `<delay>`, ...) samt Text
/// werden übersprungen.
#[derive(Default)]
struct MessageParser {
    header: Option<MessageHeader>,
    payload: Option<ChildElement>,
    body: Option<String>,
    data: String,
    depth: usize,
    capture: Option<Capture>,
}

impl MessageParser {
    /// Verarbeitet ein Start- oder Empty-Element
    ///
    /// Liefert, ob der Text des Elements gesammelt werden soll.
    fn element(&mut self, e: &BytesStart<'_>) -> Result<Option<Capture>, SignalingError> {
        match self.depth {
            0 if self.header.is_none() => {
                let name = e.local_name();
                if name.as_ref() != b"message" {
                    return Err(SignalingError::Unsupported(
                        String::from_utf8_lossy(name.as_ref()).to_string(),
                    ));
                }
                self.header = Some(MessageHeader::parse(e)?);
                Ok(None)
            }
            1 => Ok(match ChildElement::parse(e)? {
                ChildElement::Body if self.body.is_none() => {
                    self.body = Some(String::new());
                    Some(Capture::Body)
                }
                ChildElement::Body | ChildElement::Other => None,
                _ if self.payload.is_some() => None,
                child => {
                    let capture = matches!(child, ChildElement::Data { .. }).then_some(Capture::Data);
                    self.payload = Some(child);
                    capture
                }
            }),
            _ => Ok(None),
        }
    }

    fn text(&mut self, text: &str) {
        match self.capture {
            Some(Capture::Body) => {
                if let Some(body) = self.body.as_mut() {
                    body.push_str(text);
                }
            }
            Some(Capture::Data) => self.data.push_str(text),
            None => {}
        }
    }

    fn finish(self) -> Result<Stanza, SignalingError> {
        let header = self
            .header
            .ok_or_else(|| SignalingError::Malformed("empty stanza".into()))?;

        let kind = match header.msg_type.as_str() {
            "result" => StanzaKind::Result,
            "error" => StanzaKind::Error,
            "chat" | "normal" => StanzaKind::Chat {
                body: self.body.unwrap_or_default(),
            },
            TYPE_VOXMPP => match self.payload {
                Some(ChildElement::Open { block_size, sid }) => StanzaKind::Open { block_size, sid },
                Some(ChildElement::Data { seq, sid }) => StanzaKind::Data {
                    seq,
                    sid,
                    payload: self.data,
                },
                Some(ChildElement::Close { sid }) => StanzaKind::Close { sid },
                _ => {
                    return Err(SignalingError::Malformed(
                        "voxmpp message without payload".into(),
                    ))
                }
            },
            other => {
                return Err(SignalingError::Malformed(format!(
                    "unknown message type '{}'",
                    other
                )))
            }
        };

        Ok(Stanza {
            id: header.id,
            from: header.from,
            to: header.to,
            kind,
        })
    }
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<(), SignalingError> {
    writer
        .write_event(event)
        .map_err(|e| SignalingError::Malformed(e.to_string()))
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> Result<String, SignalingError> {
    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| SignalingError::Malformed(e.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_stanza_xml() {
        let stanza = Stanza::new(
            "bob@example.org",
            "42",
            StanzaKind::Open {
                block_size: 480,
                sid: "42".to_string(),
            },
        )
        .with_from("alice@example.org/voxcall");

        let xml = stanza.to_xml().unwrap();
        assert!(xml.starts_with("<message"));
        assert!(xml.contains(r#"type="voxmpp""#));
        assert!(xml.contains(NS_VOXMPP));

        assert_eq!(Stanza::from_xml(&xml).unwrap(), stanza);
    }

    #[test]
    fn test_data_stanza_keeps_payload() {
        let stanza = Stanza::new(
            "bob@example.org",
            "",
            StanzaKind::Data {
                seq: 3,
                sid: "abc".to_string(),
                payload: "AAEC/w==".to_string(),
            },
        );

        let parsed = Stanza::from_xml(&stanza.to_xml().unwrap()).unwrap();
        match parsed.kind {
            StanzaKind::Data { seq, payload, .. } => {
                assert_eq!(seq, 3);
                assert_eq!(payload, "AAEC/w==");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_result_and_error_have_no_child() {
        let result = Stanza::new("a@b", "7", StanzaKind::Result).to_xml().unwrap();
        assert!(!result.contains("<open"));
        assert_eq!(Stanza::from_xml(&result).unwrap().kind, StanzaKind::Result);

        let error = Stanza::new("a@b", "7", StanzaKind::Error).to_xml().unwrap();
        assert_eq!(Stanza::from_xml(&error).unwrap().kind, StanzaKind::Error);
    }

    #[test]
    fn test_chat_body_is_escaped() {
        let stanza = Stanza::new(
            "a@b",
            "1",
            StanzaKind::Chat {
                body: "1 < 2 & \"quotes\"".to_string(),
            },
        );
        let xml = stanza.to_xml().unwrap();
        assert!(xml.contains("&lt;"));
        assert_eq!(Stanza::from_xml(&xml).unwrap(), stanza);
    }

    #[test]
    fn test_foreign_stanzas_rejected() {
        assert!(matches!(
            Stanza::from_xml(r#"<presence from="a@b"/>"#),
            Err(SignalingError::Unsupported(_))
        ));
        assert!(matches!(
            Stanza::from_xml(
                r#"<message to="a@b" id="1" type="voxmpp"><open xmlns="urn:other"/></message>"#
            ),
            Err(SignalingError::Malformed(_))
        ));
        assert!(Stanza::from_xml("<message to=").is_err());
    }

    #[test]
    fn test_chat_body_ignores_sibling_text() {
        let stanza = Stanza::from_xml(
            r#"<message to="a@b" from="bob@b" id="1" type="chat"><thread>th-77</thread><body>hi</body></message>"#,
        )
        .unwrap();
        assert_eq!(
            stanza.kind,
            StanzaKind::Chat {
                body: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_foreign_child_before_payload_is_skipped() {
        let stanza = Stanza::from_xml(&format!(
            r#"<message to="a@b" from="bob@b" id="" type="voxmpp"><delay xmlns="urn:xmpp:delay" stamp="2024-01-01T00:00:00Z">Offline</delay><data xmlns="{}" seq="4" sid="s">AAEC</data></message>"#,
            NS_VOXMPP
        ))
        .unwrap();
        assert_eq!(
            stanza.kind,
            StanzaKind::Data {
                seq: 4,
                sid: "s".to_string(),
                payload: "AAEC".to_string()
            }
        );
    }

    #[test]
    fn test_bare_jid() {
        assert_eq!(bare_jid("alice@example.org/phone"), "alice@example.org");
        assert_eq!(bare_jid("alice@example.org"), "alice@example.org");
    }
}
