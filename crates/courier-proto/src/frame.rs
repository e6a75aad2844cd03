use std::fmt;

use thiserror::Error;

/// A bare end-of-line is a STOMP heart-beat.
pub const HEARTBEAT: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Command> {
        match value {
            "CONNECT" | "STOMP" => Some(Command::Connect),
            "CONNECTED" => Some(Command::Connected),
            "SEND" => Some(Command::Send),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "DISCONNECT" => Some(Command::Disconnect),
            "MESSAGE" => Some(Command::Message),
            "RECEIPT" => Some(Command::Receipt),
            "ERROR" => Some(Command::Error),
            _ => None,
        }
    }

    // CONNECT and CONNECTED predate header escaping and must be sent verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame is missing its NUL terminator")]
    Unterminated,
}

/// One STOMP frame. Repeated headers are kept in order; lookups return the
/// first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn destination(&self) -> Option<&str> {
        self.get("destination")
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        let escape = self.command.escapes_headers();
        for (key, value) in &self.headers {
            if escape {
                push_escaped(&mut out, key);
                out.push(':');
                push_escaped(&mut out, value);
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} headers, {} bytes)",
            self.command,
            self.headers.len(),
            self.body.len()
        )
    }
}

/// Item produced by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(Frame),
}

/// Decodes every frame and heart-beat in one transport message, failing on
/// the first malformed frame.
pub fn decode(input: &str) -> Result<Vec<Inbound>, FrameError> {
    frames(input).collect()
}

/// Lazily decodes one transport message. A malformed frame yields an error
/// and decoding resumes after that frame's NUL terminator.
pub fn frames(input: &str) -> Frames<'_> {
    Frames { rest: input }
}

#[derive(Debug, Clone)]
pub struct Frames<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Inbound, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest;
        if let Some(tail) = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')) {
            self.rest = tail;
            return Some(Ok(Inbound::Heartbeat));
        }
        if rest.is_empty() {
            return None;
        }
        match decode_one(rest) {
            Ok((frame, tail)) => {
                self.rest = tail;
                Some(Ok(Inbound::Frame(frame)))
            }
            Err(err) => {
                self.rest = rest.find('\0').map_or("", |end| &rest[end + 1..]);
                Some(Err(err))
            }
        }
    }
}

fn decode_one(input: &str) -> Result<(Frame, &str), FrameError> {
    let (line, mut rest) = next_line(input).ok_or(FrameError::Unterminated)?;
    let command =
        Command::parse(line).ok_or_else(|| FrameError::UnknownCommand(line.to_string()))?;

    let mut headers = Vec::new();
    loop {
        let (line, tail) = next_line(rest).ok_or(FrameError::Unterminated)?;
        rest = tail;
        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape(key)?, unescape(value)?));
        } else {
            headers.push((key.to_string(), value.to_string()));
        }
    }

    let length = headers
        .iter()
        .find(|(key, _)| key == "content-length")
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let (body, rest) = match length {
        Some(len) => {
            let body = rest.get(..len).ok_or(FrameError::Unterminated)?;
            let tail = rest[len..]
                .strip_prefix('\0')
                .ok_or(FrameError::Unterminated)?;
            (body, tail)
        }
        None => {
            let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        rest,
    ))
}

fn next_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = &input[..end];
    Some((line.strip_suffix('\r').unwrap_or(line), &input[end + 1..]))
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_carries_content_length() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/app/chat")
            .with_body("{\"a\":1}");
        assert_eq!(
            frame.encode(),
            "SEND\ndestination:/app/chat\ncontent-length:7\n\n{\"a\":1}\0"
        );
    }

    #[test]
    fn decodes_message_with_escaped_headers() {
        let raw = "MESSAGE\ndestination:/topic/messages\nsubscription:sub-0\nnote:a\\cb\\\\c\n\nhello\0";
        let items = decode(raw).expect("decode");
        let [Inbound::Frame(frame)] = items.as_slice() else {
            panic!("expected a single frame, got {items:?}");
        };
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.destination(), Some("/topic/messages"));
        assert_eq!(frame.get("note"), Some("a:b\\c"));
        assert_eq!(frame.body, "hello");
    }

    #[test]
    fn escaping_survives_encode_and_decode() {
        let frame = Frame::new(Command::Message)
            .header("reason", "line one\nline:two")
            .with_body("x");
        let items = decode(&frame.encode()).expect("decode");
        assert_eq!(items, vec![Inbound::Frame(frame.header("content-length", "1"))]);
    }

    #[test]
    fn connect_headers_are_not_escaped() {
        let frame = Frame::new(Command::Connected).header("server", "broker:1.2");
        assert_eq!(frame.encode(), "CONNECTED\nserver:broker:1.2\n\n\0");
        let items = decode(&frame.encode()).expect("decode");
        assert_eq!(items, vec![Inbound::Frame(frame)]);
    }

    #[test]
    fn content_length_allows_embedded_nul() {
        let raw = "MESSAGE\ndestination:/topic/x\ncontent-length:3\n\na\0b\0";
        let items = decode(raw).expect("decode");
        let [Inbound::Frame(frame)] = items.as_slice() else {
            panic!("expected a single frame");
        };
        assert_eq!(frame.body, "a\0b");
    }

    #[test]
    fn heartbeats_and_multiple_frames_in_one_message() {
        let raw = "\n\r\nRECEIPT\nreceipt-id:1\n\n\0\nMESSAGE\ndestination:/topic/a\n\nbody\0";
        let items = decode(raw).expect("decode");
        assert_eq!(items.len(), 5);
        assert_eq!(items[0], Inbound::Heartbeat);
        assert_eq!(items[1], Inbound::Heartbeat);
        assert!(matches!(&items[2], Inbound::Frame(f) if f.command == Command::Receipt));
        assert_eq!(items[3], Inbound::Heartbeat);
        assert!(matches!(&items[4], Inbound::Frame(f) if f.body == "body"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            decode("HELLO\n\n\0"),
            Err(FrameError::UnknownCommand("HELLO".into()))
        );
        assert_eq!(
            decode("MESSAGE\ndestination:/topic/a\n\nno terminator"),
            Err(FrameError::Unterminated)
        );
        assert_eq!(
            decode("MESSAGE\nbroken-header\n\n\0"),
            Err(FrameError::MalformedHeader("broken-header".into()))
        );
        assert_eq!(
            decode("MESSAGE\nbad:\\x\n\n\0"),
            Err(FrameError::InvalidEscape("\\x".into()))
        );
        assert_eq!(
            decode("MESSAGE\ncontent-length:nope\n\n\0"),
            Err(FrameError::InvalidContentLength("nope".into()))
        );
    }

    #[test]
    fn frames_skip_only_the_malformed_frame() {
        let raw = "MESSAGE\ndestination:/topic/a\n\none\0BOGUS\nx:y\n\n\0\nMESSAGE\ndestination:/topic/a\n\ntwo\0";
        let items: Vec<_> = frames(raw).collect();
        assert_eq!(items.len(), 4);
        assert!(matches!(&items[0], Ok(Inbound::Frame(f)) if f.body == "one"));
        assert_eq!(items[1], Err(FrameError::UnknownCommand("BOGUS".into())));
        assert_eq!(items[2], Ok(Inbound::Heartbeat));
        assert!(matches!(&items[3], Ok(Inbound::Frame(f)) if f.body == "two"));
    }
}
