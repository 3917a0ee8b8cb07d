pub mod execution;
pub mod paths;

use serde::{Deserialize, Serialize};

pub use execution::{BusEvent, ExecutionRecord, ExecutionStatus, ExecutionUpdate};

/// Client-local identifier for one terminal tab.
pub type HandleId = String;

/// Identifier the process host assigns to a remote shell.
pub type SessionId = String;

/// First character of every control envelope on a terminal channel.
///
/// U+001E (ASCII record separator) never appears at the start of shell
/// output a host would forward verbatim, so a text frame that begins with it
/// is always a control envelope and anything else is raw terminal output.
pub const CONTROL_PREFIX: char = '\u{1e}';

/// WebSocket close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// One message on a duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Control envelopes sent by the process host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// First message on every newly opened channel.
    Ready {
        is_reconnect: bool,
        session_id: SessionId,
        /// Output produced while no client was attached (resumes only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        buffered_output: Option<String>,
    },
    Exit {
        #[serde(default)]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Control envelopes sent to the process host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
}

/// A decoded inbound terminal frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(HostMessage),
    Raw(Vec<u8>),
}

/// Classify an inbound frame using the reserved-prefix rule.
///
/// A prefixed frame whose JSON body does not parse is an error; the caller
/// drops it rather than forwarding half an envelope to the display.
pub fn decode_inbound(frame: Frame) -> Result<Inbound, serde_json::Error> {
    match frame {
        Frame::Binary(data) => Ok(Inbound::Raw(data)),
        Frame::Text(text) => match text.strip_prefix(CONTROL_PREFIX) {
            Some(body) => serde_json::from_str(body).map(Inbound::Control),
            None => Ok(Inbound::Raw(text.into_bytes())),
        },
    }
}

/// Wrap a control message in a prefixed text frame.
pub fn encode_control<T: Serialize>(msg: &T) -> Result<Frame, serde_json::Error> {
    let json = serde_json::to_string(msg)?;
    let mut text = String::with_capacity(json.len() + CONTROL_PREFIX.len_utf8());
    text.push(CONTROL_PREFIX);
    text.push_str(&json);
    Ok(Frame::Text(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_envelope_decodes_as_control() {
        let frame = Frame::Text(format!(
            "{CONTROL_PREFIX}{}",
            r#"{"type":"ready","is_reconnect":true,"session_id":"s-1","buffered_output":"$ "}"#
        ));
        match decode_inbound(frame).unwrap() {
            Inbound::Control(HostMessage::Ready {
                is_reconnect,
                session_id,
                buffered_output,
            }) => {
                assert!(is_reconnect);
                assert_eq!(session_id, "s-1");
                assert_eq!(buffered_output.as_deref(), Some("$ "));
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn unprefixed_json_is_raw_output() {
        // A shell printing JSON must reach the display untouched.
        let text = r#"{"type":"ready","is_reconnect":false,"session_id":"x"}"#;
        let decoded = decode_inbound(Frame::Text(text.to_string())).unwrap();
        assert_eq!(decoded, Inbound::Raw(text.as_bytes().to_vec()));
    }

    #[test]
    fn binary_frames_are_raw_output() {
        let decoded = decode_inbound(Frame::Binary(vec![0x1b, b'[', b'H'])).unwrap();
        assert_eq!(decoded, Inbound::Raw(vec![0x1b, b'[', b'H']));
    }

    #[test]
    fn malformed_control_envelope_is_an_error() {
        let frame = Frame::Text(format!("{CONTROL_PREFIX}{{not json"));
        assert!(decode_inbound(frame).is_err());
    }

    #[test]
    fn encode_control_prefixes_json() {
        let frame = encode_control(&ClientMessage::Resize { rows: 40, cols: 120 }).unwrap();
        match frame {
            Frame::Text(text) => {
                assert!(text.starts_with(CONTROL_PREFIX));
                assert_eq!(&text[1..], r#"{"type":"resize","rows":40,"cols":120}"#);
            }
            Frame::Binary(_) => panic!("control envelopes are text"),
        }
    }

    #[test]
    fn exit_defaults_when_fields_missing() {
        let msg: HostMessage = serde_json::from_str(r#"{"type":"exit"}"#).unwrap();
        assert_eq!(
            msg,
            HostMessage::Exit {
                code: None,
                output: None
            }
        );
    }

    #[test]
    fn input_tag_format() {
        let json = serde_json::to_string(&ClientMessage::Input {
            data: "ls\n".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"input","data":"ls\n"}"#);
    }
}
