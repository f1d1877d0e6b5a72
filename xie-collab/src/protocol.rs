//! Text wire protocol between editor clients and the server.
//!
//! One WebSocket text frame carries one message:
//!
//! | Direction | Message |
//! |-----------|---------|
//! | client → server | `SESSIONKEY <key>` |
//! | client → server | `PING` |
//! | client → server | `CHANGE <baseRevisionId> <selectionJSON> [<changeSetJSON>]` |
//! | server → client | `HELLO <sessionStartJSON>` |
//! | server → client | `UPDATE <newRevisionId> <sourceSessionKey> <selectionsJSON> [<changeSetJSON>]` |
//! | server → client | `ACKCHANGE <baseRevisionId> <newRevisionId>` |
//!
//! Anything a client gets wrong ends its connection with a close frame whose
//! reason is the [`ProtocolError`] text.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xie_core::{ChangeSet, CharUnit};

/// Close-frame reasons are capped by the WebSocket framing.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("You shouldn't have said that: {0}")]
    UnknownCommand(String),
    #[error("Don't talk until you've announced your session key")]
    NotAnnounced,
    #[error("Protocol violation: this client already sent its session key")]
    DuplicateSessionKey,
    #[error("Protocol violation: empty session key")]
    EmptySessionKey,
    #[error("Invalid message: failed to parse revision ID {0:?}")]
    BadRevision(String),
    #[error("Invalid message: missing selection")]
    MissingSelection,
    #[error("Invalid message: bad selection JSON: {0}")]
    BadSelection(String),
    #[error("Invalid message: bad change set JSON: {0}")]
    BadChangeSet(String),
    #[error("Protocol violation: only text messages allowed")]
    BinaryFrame,
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One session's selection in the head text of its document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    /// Filled in by the server; clients may omit it.
    #[serde(default)]
    pub session_key: String,
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub caret_at_start: bool,
}

/// Payload of `HELLO`: everything a client needs to start editing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub name: String,
    pub revision_id: usize,
    pub text: Vec<CharUnit>,
    pub peer_selections: Vec<Selection>,
}

/// A parsed client → server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SessionKey(String),
    Ping,
    Change {
        base_revision: usize,
        selection: Selection,
        /// Absent for selection-only updates. Not yet validated.
        change: Option<ChangeSet>,
    },
}

/// Keep at most `max` bytes of `s`, cutting on a char boundary.
fn truncate_on_char(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Fit a human-readable reason into a close frame.
pub fn close_reason(reason: &str) -> String {
    truncate_on_char(reason, MAX_CLOSE_REASON_BYTES).to_string()
}

impl ClientMessage {
    /// Parse one text frame. JSON payloads are decoded here; the change set
    /// still has to pass [`ChangeSet::validate`] before it is used.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if let Some(key) = text.strip_prefix("SESSIONKEY ") {
            if key.is_empty() {
                return Err(ProtocolError::EmptySessionKey);
            }
            return Ok(ClientMessage::SessionKey(key.to_string()));
        }
        if text == "PING" {
            return Ok(ClientMessage::Ping);
        }
        if let Some(rest) = text.strip_prefix("CHANGE ") {
            return Self::parse_change(rest);
        }
        Err(ProtocolError::UnknownCommand(
            truncate_on_char(text, 16).to_string(),
        ))
    }

    fn parse_change(rest: &str) -> Result<Self, ProtocolError> {
        let (rev_str, payload) = rest.split_once(' ').unwrap_or((rest, ""));
        let base_revision = rev_str
            .parse::<usize>()
            .map_err(|_| ProtocolError::BadRevision(truncate_on_char(rev_str, 16).to_string()))?;

        // The selection object ends wherever its JSON ends
        let mut stream = serde_json::Deserializer::from_str(payload).into_iter::<Selection>();
        let selection = stream
            .next()
            .ok_or(ProtocolError::MissingSelection)?
            .map_err(|e| ProtocolError::BadSelection(e.to_string()))?;
        let tail = payload[stream.byte_offset()..].trim();

        let change = if tail.is_empty() {
            None
        } else {
            Some(ChangeSet::from_json(tail).map_err(|e| ProtocolError::BadChangeSet(e.to_string()))?)
        };
        Ok(ClientMessage::Change {
            base_revision,
            selection,
            change,
        })
    }
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Hello(SessionStart),
    Update {
        revision_id: usize,
        source_session_key: String,
        selections: Vec<Selection>,
        change: Option<ChangeSet>,
    },
    AckChange {
        base_revision: usize,
        new_revision: usize,
    },
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

impl ServerMessage {
    /// Render to the text frame sent on the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            ServerMessage::Hello(start) => Ok(format!("HELLO {}", to_json(start)?)),
            ServerMessage::Update {
                revision_id,
                source_session_key,
                selections,
                change,
            } => {
                let mut msg = format!(
                    "UPDATE {revision_id} {source_session_key} {}",
                    to_json(selections)?
                );
                if let Some(change) = change {
                    msg.push(' ');
                    msg.push_str(&to_json(change)?);
                }
                Ok(msg)
            }
            ServerMessage::AckChange {
                base_revision,
                new_revision,
            } => Ok(format!("ACKCHANGE {base_revision} {new_revision}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(s: &str) -> ChangeSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_session_key() {
        assert_eq!(
            ClientMessage::parse("SESSIONKEY S-a00aa0a").unwrap(),
            ClientMessage::SessionKey("S-a00aa0a".to_string())
        );
        assert_eq!(
            ClientMessage::parse("SESSIONKEY "),
            Err(ProtocolError::EmptySessionKey)
        );
    }

    #[test]
    fn test_parse_ping() {
        assert_eq!(ClientMessage::parse("PING").unwrap(), ClientMessage::Ping);
        assert!(ClientMessage::parse("PING extra").is_err());
    }

    #[test]
    fn test_parse_selection_only_change() {
        let msg = ClientMessage::parse(r#"CHANGE 3 {"start":1,"end":2,"caretAtStart":true}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Change {
                base_revision: 3,
                selection: Selection {
                    session_key: String::new(),
                    start: 1,
                    end: 2,
                    caret_at_start: true,
                },
                change: None,
            }
        );
    }

    #[test]
    fn test_parse_change_with_changeset() {
        let msg = ClientMessage::parse(
            r#"CHANGE 0 {"sessionKey":"S-x","start":0,"end":0,"caretAtStart":false} {"lengthBefore":1,"lengthAfter":2,"items":[0,{"glyph":"狗","reading":"gou3"}]}"#,
        )
        .unwrap();
        let ClientMessage::Change {
            base_revision,
            selection,
            change,
        } = msg
        else {
            panic!("expected CHANGE, got {msg:?}");
        };
        assert_eq!(base_revision, 0);
        assert_eq!(selection.session_key, "S-x");
        assert_eq!(change.unwrap().to_diag_string(), "1>0,狗(gou3)");
    }

    #[test]
    fn test_parse_selection_with_whitespace() {
        let msg = ClientMessage::parse(
            r#"CHANGE 2 { "start": 4, "end": 4 } {"lengthBefore":0,"lengthAfter":0,"items":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Change { base_revision: 2, change: Some(_), .. }
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let cases = [
            ("HELLO", "UnknownCommand"),
            ("CHANGE x {}", "BadRevision"),
            ("CHANGE -1 {}", "BadRevision"),
            ("CHANGE 1", "MissingSelection"),
            ("CHANGE 1 {\"start\":1}", "BadSelection"),
            ("CHANGE 1 nope", "BadSelection"),
            (r#"CHANGE 1 {"start":0,"end":0} {"items":[]}"#, "BadChangeSet"),
        ];
        for (text, expected) in cases {
            let err = ClientMessage::parse(text).unwrap_err();
            assert!(
                format!("{err:?}").starts_with(expected),
                "{text:?} gave {err:?}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_encode_hello() {
        let hello = ServerMessage::Hello(SessionStart {
            name: "Doc".to_string(),
            revision_id: 0,
            text: xie_core::text_from_str("A"),
            peer_selections: vec![],
        });
        assert_eq!(
            hello.encode().unwrap(),
            r#"HELLO {"name":"Doc","revisionId":0,"text":[{"glyph":"A"}],"peerSelections":[]}"#
        );
    }

    #[test]
    fn test_encode_update() {
        let selections = vec![Selection {
            session_key: "S-a".to_string(),
            start: 1,
            end: 1,
            caret_at_start: false,
        }];
        let update = ServerMessage::Update {
            revision_id: 4,
            source_session_key: "S-a".to_string(),
            selections: selections.clone(),
            change: None,
        };
        assert_eq!(
            update.encode().unwrap(),
            r#"UPDATE 4 S-a [{"sessionKey":"S-a","start":1,"end":1,"caretAtStart":false}]"#
        );

        let update = ServerMessage::Update {
            revision_id: 5,
            source_session_key: "S-a".to_string(),
            selections,
            change: Some(cs("1>0,X")),
        };
        assert!(update
            .encode()
            .unwrap()
            .ends_with(r#" {"lengthBefore":1,"lengthAfter":2,"items":[0,{"glyph":"X"}]}"#));
    }

    #[test]
    fn test_encode_ack() {
        let ack = ServerMessage::AckChange {
            base_revision: 2,
            new_revision: 7,
        };
        assert_eq!(ack.encode().unwrap(), "ACKCHANGE 2 7");
    }

    #[test]
    fn test_close_reason_truncates_on_char_boundary() {
        let long = "狗".repeat(60);
        let reason = close_reason(&long);
        assert!(reason.len() <= MAX_CLOSE_REASON_BYTES);
        assert_eq!(reason.len(), 123);
        assert_eq!(close_reason("short"), "short");
    }
}
