//! Request and response payloads carried inside envelopes.
//!
//! Payloads are flat XML-like elements. Field text is escaped (`&`, `<`,
//! `>`) so no field can ever contain a tag delimiter.

use crate::envelope::Envelope;
use crate::ProtocolError;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub from: String,
    pub to: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login(Credentials),
    Register(Credentials),
    Message(ChatRequest),
}

impl Request {
    pub fn login(username: impl Into<String>, password: impl Into<String>) -> Self {
        Request::Login(Credentials {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn register(username: impl Into<String>, password: impl Into<String>) -> Self {
        Request::Register(Credentials {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn message(
        from: impl Into<String>,
        to: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Request::Message(ChatRequest {
            from: from.into(),
            to: to.into(),
            body: body.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Login(_) => "LOGIN",
            Request::Register(_) => "REGISTER",
            Request::Message(_) => "MSG",
        }
    }

    pub fn to_payload(&self) -> String {
        let mut out = Writer::default();
        match self {
            Request::Login(c) | Request::Register(c) => {
                out.open(self.name());
                out.element("USERNAME", &c.username);
                out.element("PASSWORD", &c.password);
                out.close(self.name());
            }
            Request::Message(m) => {
                out.open("MSG");
                out.element("FROM", &m.from);
                out.element("TO", &m.to);
                out.element("BODY", &m.body);
                out.close("MSG");
            }
        }
        out.finish()
    }

    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let request = match r.peek_tag()? {
            "LOGIN" | "REGISTER" => {
                let tag = r.open_any()?;
                let creds = Credentials {
                    username: r.element("USERNAME")?,
                    password: r.element("PASSWORD")?,
                };
                r.close(tag)?;
                if tag == "LOGIN" {
                    Request::Login(creds)
                } else {
                    Request::Register(creds)
                }
            }
            "MSG" => {
                r.open("MSG")?;
                let msg = ChatRequest {
                    from: r.element("FROM")?,
                    to: r.element("TO")?,
                    body: r.element("BODY")?,
                };
                r.close("MSG")?;
                Request::Message(msg)
            }
            other => {
                return Err(ProtocolError::BadPayload(format!(
                    "unknown request <{}>",
                    excerpt(other)
                )))
            }
        };
        r.finish()?;
        Ok(request)
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::request(self.to_payload())
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Machine-readable reason carried by an `<ERROR>` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthFailed,
    UsernameTaken,
    CapacityExceeded,
    InvalidCredentials,
    CorruptFrame,
    BadRequest,
    NotAuthenticated,
    AlreadyAuthenticated,
    SenderMismatch,
    Storage,
    ServerFull,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::UsernameTaken => "USERNAME_TAKEN",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::CorruptFrame => "CORRUPT_FRAME",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::AlreadyAuthenticated => "ALREADY_AUTHENTICATED",
            ErrorCode::SenderMismatch => "SENDER_MISMATCH",
            ErrorCode::Storage => "STORAGE",
            ErrorCode::ServerFull => "SERVER_FULL",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        Some(match code {
            "AUTH_FAILED" => ErrorCode::AuthFailed,
            "USERNAME_TAKEN" => ErrorCode::UsernameTaken,
            "CAPACITY_EXCEEDED" => ErrorCode::CapacityExceeded,
            "INVALID_CREDENTIALS" => ErrorCode::InvalidCredentials,
            "CORRUPT_FRAME" => ErrorCode::CorruptFrame,
            "BAD_REQUEST" => ErrorCode::BadRequest,
            "NOT_AUTHENTICATED" => ErrorCode::NotAuthenticated,
            "ALREADY_AUTHENTICATED" => ErrorCode::AlreadyAuthenticated,
            "SENDER_MISMATCH" => ErrorCode::SenderMismatch,
            "STORAGE" => ErrorCode::Storage,
            "SERVER_FULL" => ErrorCode::ServerFull,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Login or registration accepted.
    Ok { detail: String },
    /// Chat message durably logged at `seq` and handed to `delivered` live sessions.
    Ack { seq: u64, delivered: u32 },
    Error { code: ErrorCode, detail: String },
    /// A message relayed from another session.
    Deliver(ChatRequest),
    /// Operator broadcast.
    Broadcast { text: String },
}

impl Response {
    pub fn ok(detail: impl Into<String>) -> Self {
        Response::Ok {
            detail: detail.into(),
        }
    }

    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Response::Error {
            code,
            detail: detail.into(),
        }
    }

    pub fn broadcast(text: impl Into<String>) -> Self {
        Response::Broadcast { text: text.into() }
    }

    pub fn to_payload(&self) -> String {
        let mut out = Writer::default();
        match self {
            Response::Ok { detail } => out.element("OK", detail),
            Response::Ack { seq, delivered } => {
                out.open("ACK");
                out.element("SEQ", &seq.to_string());
                out.element("DELIVERED", &delivered.to_string());
                out.close("ACK");
            }
            Response::Error { code, detail } => {
                out.open("ERROR");
                out.element("CODE", code.as_str());
                out.element("DETAIL", detail);
                out.close("ERROR");
            }
            Response::Deliver(m) => {
                out.open("DELIVER");
                out.element("FROM", &m.from);
                out.element("TO", &m.to);
                out.element("BODY", &m.body);
                out.close("DELIVER");
            }
            Response::Broadcast { text } => out.element("BROADCAST", text),
        }
        out.finish()
    }

    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload);
        let response = match r.peek_tag()? {
            "OK" => Response::Ok {
                detail: r.element("OK")?,
            },
            "ACK" => {
                r.open("ACK")?;
                let seq = r.number("SEQ")?;
                let delivered = r.number("DELIVERED")?;
                r.close("ACK")?;
                Response::Ack { seq, delivered }
            }
            "ERROR" => {
                r.open("ERROR")?;
                let code_text = r.element("CODE")?;
                let code = ErrorCode::parse(&code_text).ok_or_else(|| {
                    ProtocolError::BadPayload(format!("unknown error code {}", excerpt(&code_text)))
                })?;
                let detail = r.element("DETAIL")?;
                r.close("ERROR")?;
                Response::Error { code, detail }
            }
            "DELIVER" => {
                r.open("DELIVER")?;
                let msg = ChatRequest {
                    from: r.element("FROM")?,
                    to: r.element("TO")?,
                    body: r.element("BODY")?,
                };
                r.close("DELIVER")?;
                Response::Deliver(msg)
            }
            "BROADCAST" => Response::Broadcast {
                text: r.element("BROADCAST")?,
            },
            other => {
                return Err(ProtocolError::BadPayload(format!(
                    "unknown response <{}>",
                    excerpt(other)
                )))
            }
        };
        r.finish()?;
        Ok(response)
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope::response(self.to_payload())
    }
}

// ============================================================================
// Text helpers
// ============================================================================

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(text: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        let (c, len) = if rest.starts_with("&amp;") {
            ('&', 5)
        } else if rest.starts_with("&lt;") {
            ('<', 4)
        } else if rest.starts_with("&gt;") {
            ('>', 4)
        } else {
            return Err(ProtocolError::BadPayload("bad character escape".into()));
        };
        out.push(c);
        rest = &rest[len..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Default)]
struct Writer {
    buf: String,
}

impl Writer {
    fn open(&mut self, tag: &str) {
        self.buf.push('<');
        self.buf.push_str(tag);
        self.buf.push('>');
    }

    fn close(&mut self, tag: &str) {
        self.buf.push_str("</");
        self.buf.push_str(tag);
        self.buf.push('>');
    }

    fn element(&mut self, tag: &str, text: &str) {
        self.open(tag);
        self.buf.push_str(&escape(text));
        self.close(tag);
    }

    fn finish(self) -> String {
        self.buf
    }
}

struct Reader<'a> {
    rest: &'a str,
}

impl<'a> Reader<'a> {
    fn new(payload: &'a str) -> Self {
        Self { rest: payload }
    }

    fn bad(what: impl Into<String>) -> ProtocolError {
        ProtocolError::BadPayload(what.into())
    }

    /// Name of the next opening tag, without consuming it.
    fn peek_tag(&self) -> Result<&'a str, ProtocolError> {
        let inner = self
            .rest
            .strip_prefix('<')
            .ok_or_else(|| Self::bad("expected an opening tag"))?;
        let end = inner
            .find('>')
            .ok_or_else(|| Self::bad("unterminated tag"))?;
        let name = &inner[..end];
        if name.is_empty() || name.starts_with('/') {
            return Err(Self::bad(format!(
                "expected an opening tag, found <{}>",
                excerpt(name)
            )));
        }
        Ok(name)
    }

    fn open_any(&mut self) -> Result<&'a str, ProtocolError> {
        let name = self.peek_tag()?;
        self.rest = &self.rest[name.len() + 2..];
        Ok(name)
    }

    fn open(&mut self, tag: &str) -> Result<(), ProtocolError> {
        let name = self.peek_tag()?;
        if name != tag {
            return Err(Self::bad(format!("expected <{tag}>, found <{}>", excerpt(name))));
        }
        self.rest = &self.rest[name.len() + 2..];
        Ok(())
    }

    fn close(&mut self, tag: &str) -> Result<(), ProtocolError> {
        let closing = format!("</{tag}>");
        self.rest = self
            .rest
            .strip_prefix(closing.as_str())
            .ok_or_else(|| Self::bad(format!("expected {closing}")))?;
        Ok(())
    }

    fn element(&mut self, tag: &str) -> Result<String, ProtocolError> {
        self.open(tag)?;
        let end = self
            .rest
            .find('<')
            .ok_or_else(|| Self::bad(format!("unterminated <{tag}>")))?;
        let text = &self.rest[..end];
        self.rest = &self.rest[end..];
        self.close(tag)?;
        unescape(text)
    }

    fn number<T: std::str::FromStr>(&mut self, tag: &str) -> Result<T, ProtocolError> {
        let text = self.element(tag)?;
        text.parse()
            .map_err(|_| Self::bad(format!("<{tag}> is not a number: {:?}", excerpt(&text))))
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(Self::bad(format!(
                "trailing data after payload: {:?}",
                excerpt(self.rest)
            )))
        }
    }
}

/// Longest slice of peer-supplied text quoted back in an error detail.
const EXCERPT_CHARS: usize = 64;

/// Peer text shortened for an error detail, so a reply never grows with
/// the size of the request that caused it.
fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
