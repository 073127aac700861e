use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select, time,
};
use tracing::{debug, info, warn};

use crate::{
    hub::{ChatHub, HubConfig},
    message::{Request, Response, User, read_message, write_message},
};

pub struct Server {
    listener: TcpListener,
    hub: ChatHub,
}

impl Server {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self::with_hub(listener, ChatHub::new(config))
    }

    pub fn with_hub(listener: TcpListener, hub: ChatHub) -> Self {
        Self { listener, hub }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &ChatHub {
        &self.hub
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, hub } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    hub.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, hub: &ChatHub) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, hub),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, hub: &ChatHub) {
    let hub = hub.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, hub).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, hub: ChatHub) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    debug!(?peer, "connection accepted");
    serve_requests(&hub, &mut reader, &mut writer).await?;
    debug!(?peer, "connection finished");

    Ok(())
}

/// Answers unary requests until the peer hangs up or turns the connection
/// into a stream with `open_stream`.
async fn serve_requests<R, W>(hub: &ChatHub, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(request) = read_message::<_, Request>(reader).await? {
        let response = match request {
            Request::OpenStream { user } => return run_stream(hub, user, reader, writer).await,
            Request::Join { user } => match hub.join(user).await {
                Ok(message) => Response::Joined { message },
                Err(err) => Response::Error {
                    message: err.to_string(),
                },
            },
            Request::SendMessage { message } => {
                hub.send_message(message).await;
                Response::Empty
            }
            Request::GetUsers => Response::Users {
                users: hub.users().await,
            },
            Request::Disconnect { user } => {
                hub.disconnect(&user).await;
                Response::Empty
            }
        };
        write_message(writer, &response).await?;
    }

    Ok(())
}

/// Pushes broadcasts to the peer for as long as both the stream and the
/// transport stay open, then releases the registry entry. A peer that leaves
/// a frame unread past the hub's write timeout is dropped.
async fn run_stream<R, W>(hub: &ChatHub, user: User, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut subscription = hub.open_stream(&user).await;
    let write_limit = hub.write_timeout();

    loop {
        select! {
            outbound = subscription.recv() => {
                let Some(message) = outbound else {
                    debug!(user_id = %user.id, "stream released by registry");
                    break;
                };
                let frame = Response::Chat { message };
                match time::timeout(write_limit, write_message(writer, &frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(user_id = %user.id, error = ?err, "failed to push message to client");
                        break;
                    }
                    Err(_) => {
                        warn!(user_id = %user.id, limit = ?write_limit, "client stopped reading its stream");
                        break;
                    }
                }
            }
            inbound = read_message::<_, Request>(reader) => {
                match inbound {
                    Ok(None) => debug!(user_id = %user.id, "client closed its stream"),
                    Ok(Some(request)) => {
                        warn!(user_id = %user.id, ?request, "request on a streaming connection");
                    }
                    Err(err) => debug!(user_id = %user.id, error = ?err, "stream transport failed"),
                }
                break;
            }
        }
    }

    hub.close_stream(&user, subscription.stream_id()).await;
    Ok(())
}
