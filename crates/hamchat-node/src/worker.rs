//! Session worker -- one task per connection.
//!
//! Connected → Authenticating → Authenticated → Relaying → Closed.
//!
//! The worker owns the socket. It waits on four things at once: the next
//! inbound frame, its outbox (DELIVER / BROADCAST from other tasks), the
//! idle deadline and the server shutdown signal. Scrypt and file writes
//! run on the blocking pool so a slow disk never stalls the runtime.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::codec::Framed;

use hamchat_protocol::{
    ChatRequest, Credentials, Envelope, EnvelopeCodec, EnvelopeKind, ErrorCode, ProtocolError,
    Received, Request, Response, MAX_BODY_LEN,
};
use hamchat_storage::AccountError;

use crate::config::ServerSection;
use crate::registry::{SessionHandle, SessionState};
use crate::Relay;

/// Per-session limits, taken from `[server]`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_auth_attempts: u32,
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
    pub outbox_capacity: usize,
}

impl From<&ServerSection> for SessionSettings {
    fn from(s: &ServerSection) -> Self {
        Self {
            max_auth_attempts: s.max_auth_attempts,
            idle_timeout: s.idle_timeout(),
            max_frame_bytes: s.max_frame_bytes,
            outbox_capacity: s.outbox_capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ServerSection::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Read/write failure or an oversized frame. Ends this session only.
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    AuthFailed,
    IdleTimeout,
    Shutdown,
}

/// What to do after answering a request.
enum Step {
    Reply(Response),
    Close(Response),
}

/// Protocol state of one session, independent of the socket.
struct Session {
    relay: Relay,
    handle: SessionHandle,
    peer: SocketAddr,
    state: SessionState,
    username: Option<String>,
    auth_failures: u32,
}

impl Session {
    fn slot(&self) -> usize {
        self.handle.slot()
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.handle.set_state(state);
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<Step, SessionError> {
        if envelope.kind != EnvelopeKind::Request {
            return Ok(self.reject(ErrorCode::BadRequest, "expected a REQUEST envelope"));
        }
        let request = match Request::parse(&envelope.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(slot = self.slot(), "session: bad payload: {e}");
                return Ok(self.reject(ErrorCode::BadRequest, e.to_string()));
            }
        };

        if self.state == SessionState::Connected {
            self.transition(SessionState::Authenticating);
        }

        if self.state.is_authenticated() {
            match request {
                Request::Message(msg) => self.on_message(msg).await,
                Request::Login(_) | Request::Register(_) => Ok(self.reject(
                    ErrorCode::AlreadyAuthenticated,
                    "session is already authenticated",
                )),
            }
        } else {
            match request {
                Request::Login(creds) => self.on_login(creds).await,
                Request::Register(creds) => self.on_register(creds).await,
                Request::Message(_) => Ok(self.auth_failure(
                    ErrorCode::NotAuthenticated,
                    "log in or register before sending messages",
                )),
            }
        }
    }

    async fn on_login(&mut self, creds: Credentials) -> Result<Step, SessionError> {
        let accounts = self.relay.accounts.clone();
        let Credentials { username, password } = creds;
        let (ok, username) = tokio::task::spawn_blocking(move || {
            let ok = accounts.authenticate(&username, &password);
            (ok, username)
        })
        .await?;

        if !ok {
            tracing::info!(
                slot = self.slot(),
                peer = %self.peer,
                %username,
                "session: login failed"
            );
            return Ok(self.auth_failure(ErrorCode::AuthFailed, "invalid username or password"));
        }
        Ok(self.authenticated(username, "welcome"))
    }

    async fn on_register(&mut self, creds: Credentials) -> Result<Step, SessionError> {
        let accounts = self.relay.accounts.clone();
        let Credentials { username, password } = creds;
        let (result, username) = tokio::task::spawn_blocking(move || {
            let result = accounts.register(&username, &password);
            (result, username)
        })
        .await?;

        match result {
            Ok(()) => Ok(self.authenticated(username, "registered")),
            Err(e) => {
                tracing::info!(slot = self.slot(), %username, "session: registration refused: {e}");
                let code = match e {
                    AccountError::UsernameTaken(_) => ErrorCode::UsernameTaken,
                    AccountError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
                    AccountError::InvalidCredentials(_) => ErrorCode::InvalidCredentials,
                    AccountError::Storage(_) => ErrorCode::Storage,
                };
                Ok(self.auth_failure(code, e.to_string()))
            }
        }
    }

    fn authenticated(&mut self, username: String, verb: &str) -> Step {
        self.handle.bind_username(&username);
        tracing::info!(slot = self.slot(), peer = %self.peer, %username, "session: authenticated");
        let detail = format!("{verb} {username}");
        self.username = Some(username);
        self.transition(SessionState::Authenticated);
        Step::Reply(Response::ok(detail))
    }

    async fn on_message(&mut self, msg: ChatRequest) -> Result<Step, SessionError> {
        if self.username.as_deref() != Some(msg.from.as_str()) {
            return Ok(self.reject(
                ErrorCode::SenderMismatch,
                "FROM must match the authenticated username",
            ));
        }
        if msg.to.is_empty() {
            return Ok(self.reject(ErrorCode::BadRequest, "recipient is empty"));
        }
        if msg.body.chars().count() > MAX_BODY_LEN {
            return Ok(self.reject(
                ErrorCode::BadRequest,
                format!("message body exceeds {MAX_BODY_LEN} characters"),
            ));
        }

        // A DELIVER that cannot be framed is refused before it is logged.
        let deliver = Response::Deliver(msg.clone());
        let deliver_size = deliver.to_envelope().wire_size();
        if deliver_size > self.relay.settings.max_frame_bytes {
            return Ok(self.reject(
                ErrorCode::BadRequest,
                format!(
                    "message would need a {deliver_size}-byte frame (max {})",
                    self.relay.settings.max_frame_bytes
                ),
            ));
        }

        let history = self.relay.history.clone();
        let (logged, msg) = tokio::task::spawn_blocking(move || {
            let logged = history.append(&msg.from, &msg.to, &msg.body);
            (logged, msg)
        })
        .await?;

        let seq = match logged {
            Ok(seq) => seq,
            Err(e) => {
                tracing::error!(slot = self.slot(), "session: chat log append failed: {e}");
                return Ok(self.reject(ErrorCode::Storage, "message could not be stored"));
            }
        };

        let delivered = self.relay.registry.deliver_to(&msg.to, &deliver);
        tracing::debug!(
            slot = self.slot(),
            seq,
            to = %msg.to,
            delivered,
            "session: message relayed"
        );

        self.transition(SessionState::Relaying);
        Ok(Step::Reply(Response::Ack { seq, delivered }))
    }

    fn reject(&self, code: ErrorCode, detail: impl Into<String>) -> Step {
        Step::Reply(Response::error(code, detail))
    }

    fn auth_failure(&mut self, code: ErrorCode, detail: impl Into<String>) -> Step {
        self.auth_failures += 1;
        let response = Response::error(code, detail);
        if self.auth_failures >= self.relay.settings.max_auth_attempts {
            Step::Close(response)
        } else {
            Step::Reply(response)
        }
    }
}

/// Drives one connection from accept to close.
pub struct SessionWorker<S> {
    session: Session,
    framed: Framed<S, EnvelopeCodec>,
    outbox: mpsc::Receiver<Response>,
    shutdown: broadcast::Receiver<()>,
}

impl<S> SessionWorker<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        relay: Relay,
        handle: SessionHandle,
        stream: S,
        peer: SocketAddr,
        outbox: mpsc::Receiver<Response>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let codec = EnvelopeCodec::with_max_frame_bytes(relay.settings.max_frame_bytes);
        Self {
            session: Session {
                relay,
                handle,
                peer,
                state: SessionState::Connected,
                username: None,
                auth_failures: 0,
            },
            framed: Framed::new(stream, codec),
            outbox,
            shutdown,
        }
    }

    pub fn slot(&self) -> usize {
        self.session.slot()
    }

    /// Serve the connection until it closes. The registry slot is freed
    /// when this returns, on every path.
    pub async fn run(self) -> Result<CloseReason, SessionError> {
        let Self {
            mut session,
            mut framed,
            mut outbox,
            mut shutdown,
        } = self;

        let slot = session.slot();
        let peer = session.peer;
        let result = serve(&mut session, &mut framed, &mut outbox, &mut shutdown).await;
        session.transition(SessionState::Closed);

        match &result {
            Ok(reason) => tracing::info!(slot, %peer, ?reason, "session: closed"),
            Err(e) => tracing::warn!(slot, %peer, "session: closed on error: {e}"),
        }
        result
    }
}

async fn serve<S>(
    session: &mut Session,
    framed: &mut Framed<S, EnvelopeCodec>,
    outbox: &mut mpsc::Receiver<Response>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<CloseReason, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let idle_timeout = session.relay.settings.idle_timeout;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                return Ok(CloseReason::Shutdown);
            }

            Some(response) = outbox.recv() => {
                send_queued(framed, session.slot(), response).await?;
            }

            frame = framed.next() => {
                let received = match frame {
                    None => return Ok(CloseReason::PeerClosed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(received)) => received,
                };
                idle.as_mut().reset(Instant::now() + idle_timeout);

                match received {
                    Received::Corrupt(e) => {
                        tracing::info!(
                            slot = session.slot(),
                            "session: corrupt frame dropped: {e}"
                        );
                        let response = Response::error(ErrorCode::CorruptFrame, e.to_string());
                        send_reply(framed, session.slot(), response).await?;
                    }
                    Received::Envelope { envelope, corrections } => {
                        for c in &corrections {
                            tracing::debug!(
                                slot = session.slot(),
                                block = c.block,
                                position = c.position,
                                "session: corrected single-bit error"
                            );
                        }
                        match session.on_envelope(envelope).await? {
                            Step::Reply(response) => {
                                send_reply(framed, session.slot(), response).await?;
                            }
                            Step::Close(response) => {
                                send_reply(framed, session.slot(), response).await?;
                                return Ok(CloseReason::AuthFailed);
                            }
                        }
                    }
                }
            }

            _ = &mut idle => {
                tracing::info!(slot = session.slot(), ?idle_timeout, "session: idle timeout");
                return Ok(CloseReason::IdleTimeout);
            }
        }
    }
}

/// Write a direct reply. One too large for the frame limit is replaced by
/// a short error so the session survives.
async fn send_reply<S>(
    framed: &mut Framed<S, EnvelopeCodec>,
    slot: usize,
    response: Response,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut envelope = response.to_envelope();
    let (size, max) = (envelope.wire_size(), framed.codec().max_frame_bytes());
    if size > max {
        tracing::warn!(slot, size, max, "session: reply too large, replaced");
        envelope = Response::error(ErrorCode::BadRequest, "reply exceeds the frame limit")
            .to_envelope();
    }
    framed.send(envelope).await?;
    Ok(())
}

/// Write an item from the outbox. One too large for the frame limit is
/// dropped; it never ends the receiving session.
async fn send_queued<S>(
    framed: &mut Framed<S, EnvelopeCodec>,
    slot: usize,
    response: Response,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let envelope = response.to_envelope();
    let (size, max) = (envelope.wire_size(), framed.codec().max_frame_bytes());
    if size > max {
        tracing::warn!(slot, size, max, "session: queued item too large, dropped");
        return Ok(());
    }
    framed.send(envelope).await?;
    Ok(())
}
