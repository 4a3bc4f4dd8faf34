//! Rahmung von Audio-Frames für den Text-Kanal
//!
//! Binäre Frames werden Base64-kodiert (4:3) und als Inhalt einer
//! `data`-Stanza verschickt.

use crate::signaling::{Stanza, StanzaKind};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Invalid payload encoding: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Empty payload")]
    Empty,

    #[error("Not a data stanza")]
    NotData,
}

/// Kodiert Bytes als Base64-Text
pub fn encode(frame: &[u8]) -> String {
    BASE64.encode(frame)
}

/// Exakte Umkehrung von [`encode`]
pub fn decode(text: &str) -> Result<Vec<u8>, FramingError> {
    Ok(BASE64.decode(text.trim())?)
}

/// Baut eine `data`-Stanza an die Gegenstelle
pub fn wrap_data(to: &str, seq: u32, frame: &[u8]) -> Stanza {
    Stanza::new(
        to,
        "",
        StanzaKind::Data {
            seq,
            sid: String::new(),
            payload: encode(frame),
        },
    )
}

/// Holt den Frame aus einer empfangenen `data`-Stanza
pub fn unwrap_data(stanza: &Stanza) -> Result<Vec<u8>, FramingError> {
    match &stanza.kind {
        StanzaKind::Data { payload, .. } => {
            let frame = decode(payload)?;
            if frame.is_empty() {
                return Err(FramingError::Empty);
            }
            Ok(frame)
        }
        _ => Err(FramingError::NotData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_inverse() {
        for frame in [
            vec![],
            vec![0u8],
            vec![0xff, 0x00],
            (0..=255u8).collect::<Vec<_>>(),
        ] {
            assert_eq!(decode(&encode(&frame)).unwrap(), frame);
        }
    }

    #[test]
    fn test_expansion_is_four_thirds() {
        assert_eq!(encode(&[0u8; 30]).len(), 40);
    }

    #[test]
    fn test_malformed_text_rejected() {
        // falsches Padding
        assert!(matches!(decode("AAE"), Err(FramingError::Decode(_))));
        // ungültiges Zeichen
        assert!(matches!(decode("AA*A"), Err(FramingError::Decode(_))));
    }

    #[test]
    fn test_wrap_unwrap_data() {
        let frame = [1u8, 2, 3, 250];
        let stanza = wrap_data("bob@example.org", 5, &frame);
        assert_eq!(stanza.to, "bob@example.org");
        assert_eq!(unwrap_data(&stanza).unwrap(), frame);
    }

    #[test]
    fn test_unwrap_rejects_other_stanzas() {
        let stanza = Stanza::new("a@b", "1", StanzaKind::Result);
        assert!(matches!(unwrap_data(&stanza), Err(FramingError::NotData)));

        let empty = wrap_data("a@b", 0, &[]);
        assert!(matches!(unwrap_data(&empty), Err(FramingError::Empty)));
    }
}
