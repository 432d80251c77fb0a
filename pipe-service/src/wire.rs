// Line-oriented message grammar shared by both endpoints.
//
// Every message is one newline-terminated line of `|`-separated fields,
// with the message kind in field 0. The final field of a message is the
// remainder of the line, so JSON payloads in that position may contain
// literal `|` characters. Command and query argument lists are `|`-split
// and must not contain `|` themselves.

use thiserror::Error;

pub const COMMAND: &str = "command";
pub const QUERY: &str = "query";
pub const EVENT: &str = "event";
pub const SUCCESS: &str = "success";
pub const ERROR: &str = "error";

/// Reply prefix for lines whose kind tag is not recognized.
pub const UNKNOWN_PREFIX: &str = "UNKNOWN:";

/// Built-in command: the client declares interest in a named event.
pub const ATTACH_EVENT: &str = "attachevent";
/// Built-in command: the client tells the server which OS process to watch.
pub const SET_PROCESS_ID: &str = "setprocessid";

pub const SEPARATOR: char = '|';

/// A parsed inbound line. Names are normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command { name: String, args: Vec<String> },
    Query { name: String, args: Vec<String> },
    Event { name: String, payload: Option<String> },
    Success { text: Option<String> },
    Error { text: Option<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unrecognized message kind in \"{0}\"")]
    UnknownKind(String),
    #[error("not enough fields: expected {expected}, received {received}")]
    TooFewFields { expected: usize, received: usize },
}

pub fn parse(line: &str) -> Result<Message, WireError> {
    let (kind, rest) = match line.split_once(SEPARATOR) {
        Some((kind, rest)) => (kind, Some(rest)),
        None => (line, None),
    };

    if kind.eq_ignore_ascii_case(COMMAND) || kind.eq_ignore_ascii_case(QUERY) {
        // Empty fields are dropped from argument lists.
        let fields: Vec<&str> = rest
            .map(|r| r.split(SEPARATOR).filter(|f| !f.is_empty()).collect())
            .unwrap_or_default();
        if fields.is_empty() {
            return Err(WireError::TooFewFields { expected: 2, received: 1 });
        }
        let name = fields[0].to_ascii_lowercase();
        let args = fields[1..].iter().map(|s| s.to_string()).collect();
        if kind.eq_ignore_ascii_case(COMMAND) {
            Ok(Message::Command { name, args })
        } else {
            Ok(Message::Query { name, args })
        }
    } else if kind.eq_ignore_ascii_case(EVENT) {
        let Some(rest) = rest else {
            return Err(WireError::TooFewFields { expected: 2, received: 1 });
        };
        let (name, payload) = match rest.split_once(SEPARATOR) {
            Some((name, payload)) => {
                let payload = if payload.is_empty() { None } else { Some(payload.to_string()) };
                (name, payload)
            }
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(WireError::TooFewFields { expected: 2, received: 1 });
        }
        Ok(Message::Event { name: name.to_ascii_lowercase(), payload })
    } else if kind.eq_ignore_ascii_case(SUCCESS) {
        Ok(Message::Success { text: rest.filter(|r| !r.is_empty()).map(str::to_string) })
    } else if kind.eq_ignore_ascii_case(ERROR) {
        Ok(Message::Error { text: rest.filter(|r| !r.is_empty()).map(str::to_string) })
    } else {
        Err(WireError::UnknownKind(line.to_string()))
    }
}

pub fn command_line(name: &str, payload: Option<&str>) -> String {
    assemble(COMMAND, name, payload)
}

pub fn query_line(name: &str, payload: Option<&str>) -> String {
    assemble(QUERY, name, payload)
}

pub fn event_line(name: &str, payload: &str) -> String {
    format!("{}{}{}{}{}", EVENT, SEPARATOR, name, SEPARATOR, payload)
}

pub fn success_line(text: Option<&str>) -> String {
    match text {
        Some(text) if !text.is_empty() => format!("{}{}{}", SUCCESS, SEPARATOR, text),
        _ => SUCCESS.to_string(),
    }
}

pub fn error_line(text: &str) -> String {
    format!("{}{}{}", ERROR, SEPARATOR, text)
}

pub fn unknown_line(original: &str) -> String {
    format!("{}{}", UNKNOWN_PREFIX, original)
}

/// True for inbound lines that are themselves UNKNOWN replies. These are
/// logged and dropped, never answered, so two endpoints cannot ping-pong
/// UNKNOWN replies at each other.
pub fn is_unknown_reply(line: &str) -> bool {
    line.get(..UNKNOWN_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(UNKNOWN_PREFIX))
}

fn assemble(kind: &str, name: &str, payload: Option<&str>) -> String {
    match payload {
        Some(payload) if !payload.is_empty() => {
            format!("{}{}{}{}{}", kind, SEPARATOR, name, SEPARATOR, payload)
        }
        _ => format!("{}{}{}", kind, SEPARATOR, name),
    }
}
