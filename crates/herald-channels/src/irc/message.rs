//! IRC line parsing and outbound text shaping

/// Longest payload put on a single outbound line. The server prepends our own
/// prefix when relaying, so this stays well below the 512 byte line limit.
pub const MAX_PAYLOAD_BYTES: usize = 400;

/// Replaces line breaks in outbound text
pub const LINE_SEPARATOR: &str = " | ";

/// One parsed protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse a raw line. Message tags are skipped. Returns `None` for blank input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        if rest.starts_with('@') {
            rest = rest.split_once(' ').map(|(_, r)| r).unwrap_or("");
        }
        rest = rest.trim_start_matches(' ');

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, remaining) = stripped.split_once(' ').unwrap_or((stripped, ""));
            rest = remaining.trim_start_matches(' ');
            Some(prefix.to_string())
        } else {
            None
        };

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            let (param, remaining) = rest.split_once(' ').unwrap_or((rest, ""));
            params.push(param.to_string());
            rest = remaining;
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Last parameter, usually the free-text part
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// Nickname part of a `nick!user@host` prefix
    pub fn source_nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split(['!', '@']).next().unwrap_or(prefix))
    }
}

/// Channel names start with one of the standard channel prefixes
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

/// Collapse line breaks into [`LINE_SEPARATOR`], dropping blank lines
pub fn flatten_lines(text: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join(LINE_SEPARATOR)
}

/// Split text into chunks of at most `max_bytes`, preferring word boundaries
pub fn split_payload(text: &str, max_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // Break on the last space when the cut lands inside a word
        if !rest[cut..].starts_with(' ')
            && let Some(space) = rest[..cut].rfind(' ')
            && space > 0
        {
            cut = space;
        }
        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_privmsg() {
        let msg = IrcMessage::parse(":alice!a@host PRIVMSG #ops :hello there\r\n").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#ops", "hello there"]);
        assert_eq!(msg.source_nick(), Some("alice"));
        assert_eq!(msg.trailing(), Some("hello there"));
    }

    #[test]
    fn test_parse_without_prefix() {
        let msg = IrcMessage::parse("PING :irc.example.org").unwrap();
        assert!(msg.prefix.is_none());
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.param(0), Some("irc.example.org"));
    }

    #[test]
    fn test_parse_cap_ack() {
        let msg = IrcMessage::parse(":server CAP * ACK :sasl").unwrap();
        assert_eq!(msg.params, vec!["*", "ACK", "sasl"]);
    }

    #[test]
    fn test_parse_skips_tags() {
        let msg = IrcMessage::parse("@time=2024-01-01T00:00:00Z :bob PRIVMSG herald :hi").unwrap();
        assert_eq!(msg.source_nick(), Some("bob"));
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn test_parse_empty_trailing_and_blank() {
        let msg = IrcMessage::parse("AUTHENTICATE +").unwrap();
        assert_eq!(msg.param(0), Some("+"));
        assert!(IrcMessage::parse("").is_none());
        assert!(IrcMessage::parse("\r\n").is_none());
    }

    #[test]
    fn test_source_nick_server_prefix() {
        let msg = IrcMessage::parse(":irc.example.org 001 herald :Welcome").unwrap();
        assert_eq!(msg.source_nick(), Some("irc.example.org"));
    }

    #[test]
    fn test_is_channel_name() {
        assert!(is_channel_name("#ops"));
        assert!(is_channel_name("&local"));
        assert!(!is_channel_name("alice"));
    }

    #[test]
    fn test_flatten_lines() {
        assert_eq!(flatten_lines("one\r\ntwo\n\nthree"), "one | two | three");
        assert_eq!(flatten_lines("single"), "single");
    }

    #[test]
    fn test_split_payload_words() {
        let chunks = split_payload("aaaa bbbb cccc", 9);
        assert_eq!(chunks, vec!["aaaa bbbb", "cccc"]);
    }

    #[test]
    fn test_split_payload_respects_char_boundaries() {
        let text = "é".repeat(10);
        let chunks = split_payload(&text, 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_payload_short() {
        assert_eq!(split_payload("hi", MAX_PAYLOAD_BYTES), vec!["hi"]);
        assert!(split_payload("", MAX_PAYLOAD_BYTES).is_empty());
    }
}
