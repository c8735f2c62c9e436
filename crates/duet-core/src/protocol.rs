//! Line-delimited relay protocol.
//!
//! One command per line, fields joined with `:`. Every field is escaped
//! (`\` → `\\`, `:` → `\:`, LF → `\n`, CR → `\r`) so content may carry the
//! delimiter and line breaks; the command word itself is never escaped.
//!
//! Client to relay:
//! - `LOGIN:<username>`
//! - `HEARTBEAT`
//! - `MSG:<content>`
//! - `PRIVATE:<receiver>:<content>`
//! - `GET_USERS`
//! - `LOGOUT:<username>`
//!
//! Relay to client:
//! - `LOGIN_SUCCESS`, `ERROR:<reason>`, `HEARTBEAT_ACK`
//! - `MSG:<sender>:<content>:<timestamp>` (broadcast)
//! - `MSG:<sender>:<receiver>:<content>:<timestamp>` (private)
//! - `USERS:<comma-separated usernames>`

use chrono::NaiveDateTime;

use crate::error::{Error, Result};

/// Format of relay-stamped timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const LOGIN: &str = "LOGIN";
const LOGIN_SUCCESS: &str = "LOGIN_SUCCESS";
const LOGOUT: &str = "LOGOUT";
const HEARTBEAT: &str = "HEARTBEAT";
const HEARTBEAT_ACK: &str = "HEARTBEAT_ACK";
const MSG: &str = "MSG";
const PRIVATE: &str = "PRIVATE";
const GET_USERS: &str = "GET_USERS";
const USERS: &str = "USERS";
const ERROR: &str = "ERROR";

/// A command sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(String),
    Logout(String),
    Heartbeat,
    Broadcast(String),
    Private { receiver: String, content: String },
    GetUsers,
}

impl Command {
    /// Command word, for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Login(_) => LOGIN,
            Self::Logout(_) => LOGOUT,
            Self::Heartbeat => HEARTBEAT,
            Self::Broadcast(_) => MSG,
            Self::Private { .. } => PRIVATE,
            Self::GetUsers => GET_USERS,
        }
    }

    /// Encode without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Self::Login(user) => join(LOGIN, &[user]),
            Self::Logout(user) => join(LOGOUT, &[user]),
            Self::Heartbeat => HEARTBEAT.to_owned(),
            Self::Broadcast(content) => join(MSG, &[content]),
            Self::Private { receiver, content } => join(PRIVATE, &[receiver, content]),
            Self::GetUsers => GET_USERS.to_owned(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let (word, fields) = split_line(line)?;
        match (word, fields.as_slice()) {
            (LOGIN, [user]) => Ok(Self::Login(user.clone())),
            (LOGOUT, [user]) => Ok(Self::Logout(user.clone())),
            (HEARTBEAT, []) => Ok(Self::Heartbeat),
            (MSG, [content]) => Ok(Self::Broadcast(content.clone())),
            (PRIVATE, [receiver, content]) => Ok(Self::Private {
                receiver: receiver.clone(),
                content: content.clone(),
            }),
            (GET_USERS, []) => Ok(Self::GetUsers),
            (LOGIN | LOGOUT | HEARTBEAT | MSG | PRIVATE | GET_USERS, _) => Err(Error::Protocol(
                format!("wrong number of fields for {word}"),
            )),
            _ => Err(Error::UnknownCommand(word.to_owned())),
        }
    }
}

/// A line sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    LoginSuccess,
    Error(String),
    HeartbeatAck,
    Broadcast {
        sender: String,
        content: String,
        timestamp: NaiveDateTime,
    },
    Private {
        sender: String,
        receiver: String,
        content: String,
        timestamp: NaiveDateTime,
    },
    Users(Vec<String>),
}

impl ServerMessage {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error(reason.into())
    }

    /// Encode without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Self::LoginSuccess => LOGIN_SUCCESS.to_owned(),
            Self::Error(reason) => join(ERROR, &[reason]),
            Self::HeartbeatAck => HEARTBEAT_ACK.to_owned(),
            Self::Broadcast {
                sender,
                content,
                timestamp,
            } => {
                let ts = timestamp.format(TIMESTAMP_FORMAT).to_string();
                join(MSG, &[sender, content, &ts])
            }
            Self::Private {
                sender,
                receiver,
                content,
                timestamp,
            } => {
                let ts = timestamp.format(TIMESTAMP_FORMAT).to_string();
                join(MSG, &[sender, receiver, content, &ts])
            }
            Self::Users(names) => join(USERS, &[&names.join(",")]),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let (word, fields) = split_line(line)?;
        match (word, fields.as_slice()) {
            (LOGIN_SUCCESS, []) => Ok(Self::LoginSuccess),
            (HEARTBEAT_ACK, []) => Ok(Self::HeartbeatAck),
            (ERROR, [reason]) => Ok(Self::Error(reason.clone())),
            (MSG, [sender, content, ts]) => Ok(Self::Broadcast {
                sender: sender.clone(),
                content: content.clone(),
                timestamp: parse_timestamp(ts)?,
            }),
            (MSG, [sender, receiver, content, ts]) => Ok(Self::Private {
                sender: sender.clone(),
                receiver: receiver.clone(),
                content: content.clone(),
                timestamp: parse_timestamp(ts)?,
            }),
            (USERS, [list]) => Ok(Self::Users(
                list.split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect(),
            )),
            _ => Err(Error::Protocol(format!("unexpected server line: {word}"))),
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| Error::Protocol(format!("bad timestamp {raw:?}: {e}")))
}

/// Escape a single protocol field.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\:"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape`]. Dangling or unknown escapes are rejected.
pub fn unescape(field: &str) -> Result<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some(':') => out.push(':'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                return Err(Error::Protocol(format!("unknown escape \\{other}")));
            }
            None => return Err(Error::Protocol("dangling escape".to_owned())),
        }
    }
    Ok(out)
}

fn join(word: &str, fields: &[&str]) -> String {
    let mut line = String::from(word);
    for field in fields {
        line.push(':');
        line.push_str(&escape(field));
    }
    line
}

/// Split a line into its command word and unescaped fields.
fn split_line(line: &str) -> Result<(&str, Vec<String>)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some((word, rest)) = line.split_once(':') else {
        return Ok((line, Vec::new()));
    };

    let mut fields = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ':' {
            fields.push(unescape(&rest[start..i])?);
            start = i + 1;
        }
    }
    fields.push(unescape(&rest[start..])?);
    Ok((word, fields))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 20)
            .unwrap()
            .and_hms_opt(13, 14, 15)
            .unwrap()
    }

    #[test]
    fn parses_plain_client_commands() {
        assert_eq!(
            Command::parse("LOGIN:alice").unwrap(),
            Command::Login("alice".into())
        );
        assert_eq!(Command::parse("HEARTBEAT").unwrap(), Command::Heartbeat);
        assert_eq!(Command::parse("GET_USERS\r").unwrap(), Command::GetUsers);
        assert_eq!(
            Command::parse("PRIVATE:bob:hello").unwrap(),
            Command::Private {
                receiver: "bob".into(),
                content: "hello".into()
            }
        );
    }

    #[test]
    fn content_with_delimiters_survives() {
        let cmd = Command::Private {
            receiver: "bob".into(),
            content: "time: 10:30\nsee C:\\tmp".into(),
        };
        let line = cmd.encode();
        assert!(!line.contains('\n'));
        assert_eq!(Command::parse(&line).unwrap(), cmd);
    }

    #[test]
    fn unknown_and_malformed_commands_are_rejected() {
        assert!(matches!(
            Command::parse("SHOUT:hi"),
            Err(Error::UnknownCommand(w)) if w == "SHOUT"
        ));
        assert!(Command::parse("PRIVATE:bob").is_err());
        assert!(Command::parse("LOGIN:bad\\x").is_err());
        assert!(Command::parse("LOGIN:dangling\\").is_err());
    }

    #[test]
    fn broadcast_and_private_reflow_are_distinguished() {
        let broadcast = ServerMessage::Broadcast {
            sender: "alice".into(),
            content: "hi all".into(),
            timestamp: ts(),
        };
        assert_eq!(
            broadcast.encode(),
            "MSG:alice:hi all:2024-05-20 13\\:14\\:15"
        );
        assert_eq!(ServerMessage::parse(&broadcast.encode()).unwrap(), broadcast);

        let private = ServerMessage::Private {
            sender: "alice".into(),
            receiver: "bob".into(),
            content: "{\"kind\":\"ack\"}".into(),
            timestamp: ts(),
        };
        assert_eq!(ServerMessage::parse(&private.encode()).unwrap(), private);
    }

    #[test]
    fn users_list_handles_empty() {
        assert_eq!(
            ServerMessage::parse("USERS:").unwrap(),
            ServerMessage::Users(vec![])
        );
        assert_eq!(
            ServerMessage::parse("USERS:alice,bob").unwrap(),
            ServerMessage::Users(vec!["alice".into(), "bob".into()])
        );
    }

    #[test]
    fn error_reason_keeps_colons() {
        let msg = ServerMessage::error("user bob: offline");
        assert_eq!(ServerMessage::parse(&msg.encode()).unwrap(), msg);
    }
}
