//! Parsing of interactive `duet` input lines.

/// One line typed at the `duet` prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `@peer text`
    Send { to: String, text: String },
    /// `/peer name`
    SwitchPeer(String),
    /// `/users`
    Users,
    /// `/history`
    History,
    /// `/quit`
    Quit,
    /// Anything else goes to the current peer, or to everyone.
    Text(String),
    Empty,
}

impl Input {
    /// `Err` carries a usage hint.
    pub fn parse(line: &str) -> Result<Self, &'static str> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }

        if let Some(rest) = line.strip_prefix('@') {
            let (to, text) = rest.split_once(char::is_whitespace).ok_or("usage: @peer text")?;
            let text = text.trim();
            if to.is_empty() || text.is_empty() {
                return Err("usage: @peer text");
            }
            return Ok(Self::Send {
                to: to.to_owned(),
                text: text.to_owned(),
            });
        }

        if let Some(rest) = line.strip_prefix('/') {
            let mut words = rest.split_whitespace();
            return match (words.next(), words.next(), words.next()) {
                (Some("peer"), Some(name), None) => Ok(Self::SwitchPeer(name.to_owned())),
                (Some("peer"), ..) => Err("usage: /peer name"),
                (Some("users"), None, _) => Ok(Self::Users),
                (Some("history"), None, _) => Ok(Self::History),
                (Some("quit"), None, _) => Ok(Self::Quit),
                _ => Err("commands: /peer name, /users, /history, /quit"),
            };
        }

        Ok(Self::Text(line.to_owned()))
    }
}
