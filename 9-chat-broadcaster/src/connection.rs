//! Client side of the wire protocol.
//!
//! [`Connection`] is one TCP connection speaking request/response frames.
//! [`RpcClient`] wraps it with per-call timeouts and redials with backoff when
//! a failure is retryable. [`MessageStream`] is a connection that has been
//! turned into a server push stream with `open_stream`.

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
    io::BufReader,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};
use tracing::{debug, warn};

use crate::{
    message::{ChatMessage, Request, Response, User, read_message, write_message},
    retry::RetryPolicy,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
    #[error("server closed the connection")]
    Closed,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected response from server: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether redialing and repeating the call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connect { .. } | ClientError::TimedOut(_) | ClientError::Closed => true,
            ClientError::Io(err) => err.kind() != io::ErrorKind::InvalidData,
            ClientError::Rejected(_) | ClientError::Protocol(_) => false,
        }
    }
}

pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn dial(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        debug!("connected to {addr}");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one request and waits at most `limit` for its response.
    /// Server-side errors are turned into [`ClientError::Rejected`].
    pub async fn call(&mut self, request: &Request, limit: Duration) -> Result<Response, ClientError> {
        match time::timeout(limit, self.exchange(request)).await {
            Ok(Ok(Response::Error { message })) => Err(ClientError::Rejected(message)),
            Ok(result) => result,
            Err(_) => Err(ClientError::TimedOut(limit)),
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response, ClientError> {
        write_message(&mut self.writer, request).await?;
        read_message::<_, Response>(&mut self.reader)
            .await?
            .ok_or(ClientError::Closed)
    }

    /// Turns this connection into the push stream for `user`.
    pub async fn open_stream(mut self, user: &User) -> Result<MessageStream, ClientError> {
        write_message(&mut self.writer, &Request::OpenStream { user: user.clone() }).await?;
        Ok(MessageStream {
            reader: self.reader,
            _writer: self.writer,
        })
    }
}

pub struct MessageStream {
    reader: BufReader<OwnedReadHalf>,
    // Dropping the write half would read as a hang-up on the server.
    _writer: OwnedWriteHalf,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Result<ChatMessage, ClientError> {
        match read_message::<_, Response>(&mut self.reader).await? {
            Some(Response::Chat { message }) => Ok(message),
            Some(Response::Error { message }) => Err(ClientError::Rejected(message)),
            Some(other) => Err(ClientError::Protocol(format!("{other:?}"))),
            None => Err(ClientError::Closed),
        }
    }
}

/// Request/response client that redials on retryable failures.
pub struct RpcClient {
    addr: SocketAddr,
    request_timeout: Duration,
    retry: RetryPolicy,
    connection: Option<Connection>,
}

impl RpcClient {
    pub fn new(addr: SocketAddr, request_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            addr,
            request_timeout,
            retry,
            connection: None,
        }
    }

    pub async fn join(&mut self, user: &User) -> Result<String, ClientError> {
        match self.call(Request::Join { user: user.clone() }).await? {
            Response::Joined { message } => Ok(message),
            other => Err(unexpected(other)),
        }
    }

    pub async fn send_message(&mut self, message: ChatMessage) -> Result<(), ClientError> {
        match self.call(Request::SendMessage { message }).await? {
            Response::Empty => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_users(&mut self) -> Result<Vec<User>, ClientError> {
        match self.call(Request::GetUsers).await? {
            Response::Users { users } => Ok(users),
            other => Err(unexpected(other)),
        }
    }

    pub async fn disconnect(&mut self, user: &User) -> Result<(), ClientError> {
        match self.call(Request::Disconnect { user: user.clone() }).await? {
            Response::Empty => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Dials a dedicated connection and opens `user`'s push stream on it.
    pub async fn open_stream(&self, user: &User) -> Result<MessageStream, ClientError> {
        let mut backoff = self.retry.backoff();
        loop {
            let attempt = match Connection::dial(self.addr).await {
                Ok(connection) => connection.open_stream(user).await,
                Err(err) => Err(err),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %err, ?delay, retry = backoff.retries(), "failed to open stream; retrying");
                        time::sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        let mut backoff = self.retry.backoff();
        loop {
            let err = match self.try_call(&request).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }

            // The connection may hold a late response; never reuse it.
            self.connection = None;
            match backoff.next_delay() {
                Some(delay) => {
                    warn!(error = %err, ?delay, retry = backoff.retries(), "request failed; retrying");
                    time::sleep(delay).await;
                }
                None => return Err(err),
            }
        }
    }

    async fn try_call(&mut self, request: &Request) -> Result<Response, ClientError> {
        if self.connection.is_none() {
            self.connection = Some(Connection::dial(self.addr).await?);
        }
        match self.connection.as_mut() {
            Some(connection) => connection.call(request, self.request_timeout).await,
            None => Err(ClientError::Closed),
        }
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::Protocol(format!("{response:?}"))
}
