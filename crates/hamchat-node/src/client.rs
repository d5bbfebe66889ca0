//! Relay client -- the connecting side of the protocol.
//!
//! Relayed messages and broadcasts can arrive between a request and its
//! reply. Calls that wait for a reply park those in a queue that
//! [`RelayClient::next_response`] drains first.

use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

use hamchat_protocol::{
    BlockCorrection, Envelope, EnvelopeCodec, EnvelopeKind, ProtocolError, Received, Request,
    Response,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server closed the connection")]
    Closed,
    #[error("server sent a corrupt frame: {0}")]
    CorruptReply(ProtocolError),
    #[error("server sent a REQUEST envelope")]
    UnexpectedKind,
    #[error("not logged in")]
    NotLoggedIn,
}

/// A decoded server response and any bit errors repaired on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub response: Response,
    pub corrections: Vec<BlockCorrection>,
}

pub struct RelayClient {
    framed: Framed<TcpStream, EnvelopeCodec>,
    pending: VecDeque<Reply>,
    username: Option<String>,
}

impl RelayClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;
        Ok(Self {
            framed: Framed::new(stream, EnvelopeCodec::new()),
            pending: VecDeque::new(),
            username: None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<Reply, ClientError> {
        let reply = self.request(&Request::login(username, password)).await?;
        self.remember_login(username, &reply);
        Ok(reply)
    }

    pub async fn register(&mut self, username: &str, password: &str) -> Result<Reply, ClientError> {
        let reply = self.request(&Request::register(username, password)).await?;
        self.remember_login(username, &reply);
        Ok(reply)
    }

    /// Send a chat message as the logged-in user and wait for the ACK or error.
    pub async fn send_message(&mut self, to: &str, body: &str) -> Result<Reply, ClientError> {
        let from = self.username.clone().ok_or(ClientError::NotLoggedIn)?;
        self.request(&Request::message(from, to, body)).await
    }

    /// Send any request and wait for its direct reply.
    pub async fn request(&mut self, request: &Request) -> Result<Reply, ClientError> {
        self.send_envelope(&request.to_envelope()).await?;
        loop {
            let reply = self.read_reply().await?;
            match reply.response {
                Response::Deliver(_) | Response::Broadcast { .. } => self.pending.push_back(reply),
                _ => return Ok(reply),
            }
        }
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        self.framed.send(envelope).await?;
        Ok(())
    }

    /// Write bytes to the socket unframed. For exercising the server's
    /// handling of damaged input.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.map_err(ProtocolError::from)?;
        stream.flush().await.map_err(ProtocolError::from)?;
        Ok(())
    }

    /// Next response from the server, queued ones first.
    pub async fn next_response(&mut self) -> Result<Reply, ClientError> {
        match self.pending.pop_front() {
            Some(reply) => Ok(reply),
            None => self.read_reply().await,
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        match self.framed.next().await {
            None => Err(ClientError::Closed),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(Received::Corrupt(e))) => Err(ClientError::CorruptReply(e)),
            Some(Ok(Received::Envelope {
                envelope,
                corrections,
            })) => {
                if envelope.kind != EnvelopeKind::Response {
                    return Err(ClientError::UnexpectedKind);
                }
                if !corrections.is_empty() {
                    tracing::debug!(count = corrections.len(), "client: corrected bit errors");
                }
                let response = Response::parse(&envelope.payload)?;
                Ok(Reply {
                    response,
                    corrections,
                })
            }
        }
    }

    fn remember_login(&mut self, username: &str, reply: &Reply) {
        if matches!(reply.response, Response::Ok { .. }) {
            self.username = Some(username.to_string());
        }
    }
}
