//! STOMP 1.2 frame codec.
//!
//! The DUET message broker speaks STOMP over a WebSocket. Every WebSocket
//! text message carries one frame:
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//!
//! A lone end-of-line is a heart-beat and decodes to `None`.

use crate::error::EnvError;

/// Frame terminator (NUL octet).
const NUL: char = '\0';

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command (`CONNECT`, `MESSAGE`, ...)
    pub command: String,

    /// Ordered headers; for repeated names the first one wins
    pub headers: Vec<(String, String)>,

    /// Frame body
    pub body: String,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Adds a header (builder style).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body (builder style).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the first header value with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame for a virtual host.
    pub fn connect(host: &str) -> Self {
        Self::new("CONNECT")
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", "0,0")
    }

    /// SUBSCRIBE frame.
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new("SUBSCRIBE")
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    /// SEND frame carrying a JSON body.
    pub fn send(destination: &str, body: &str) -> Self {
        Self::new("SEND")
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_header("content-length", body.len().to_string())
            .with_body(body)
    }

    /// DISCONNECT frame.
    pub fn disconnect() -> Self {
        Self::new("DISCONNECT")
    }

    /// Serializes the frame to wire text.
    pub fn encode(&self) -> String {
        let escape = escapes_headers(&self.command);
        let mut out = String::with_capacity(self.command.len() + self.body.len() + 64);
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }

    /// Parses wire text into a frame.
    ///
    /// # Returns
    /// * `Ok(None)` - heart-beat (only end-of-line octets)
    /// * `Ok(Some(frame))` - a complete frame
    /// * `Err(EnvError::SerializationError)` - malformed frame
    pub fn decode(text: &str) -> Result<Option<Self>, EnvError> {
        let trimmed = text.trim_start_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(None);
        }

        let (head, rest) = split_head(trimmed)
            .ok_or_else(|| EnvError::SerializationError("frame has no header terminator".into()))?;

        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let command = lines
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| EnvError::SerializationError("frame has no command".into()))?
            .to_string();

        let unescape = escapes_headers(&command);
        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| EnvError::SerializationError(format!("bad header line: {line}")))?;
            if unescape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let body = match rest.find(NUL) {
            Some(end) => &rest[..end],
            None => rest,
        };

        Ok(Some(Self {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

/// CONNECT and CONNECTED frames do not escape header octets.
fn escapes_headers(command: &str) -> bool {
    command != "CONNECT" && command != "CONNECTED"
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    if let Some(idx) = text.find("\r\n\r\n") {
        return Some((&text[..idx], &text[idx + 4..]));
    }
    text.find("\n\n").map(|idx| (&text[..idx], &text[idx + 2..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, EnvError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(EnvError::SerializationError(format!(
                    "undefined header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}
