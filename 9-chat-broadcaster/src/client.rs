use std::{future::Future, io::IsTerminal, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    sync::{Mutex, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    connection::{ClientError, MessageStream, RpcClient},
    input::Input,
    message::{ChatMessage, User},
    retry::RetryPolicy,
};

pub const WELCOME: &str = "Welcome to the chat! To talk, just start typing!";

const CLEAR_LINE: &[u8] = b"\x1b[2K\r";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    /// Limit for each request/response exchange.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            request_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }

    fn rpc(&self) -> RpcClient {
        RpcClient::new(self.server, self.request_timeout, self.retry.clone())
    }
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            server: args.server,
            request_timeout: Duration::from_millis(args.send_timeout_ms),
            retry: RetryPolicy {
                max_attempts: args.max_retries.saturating_add(1),
                initial_backoff: Duration::from_millis(args.initial_backoff_ms),
                ..RetryPolicy::default()
            },
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::from(&args);
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    let name = match args.name {
        Some(name) => name,
        None => ask_username(&mut stdin, &mut stdout).await?,
    };
    let interactive = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();

    let session = Session::connect(config, User::generate(name)).await?;
    session.run(stdin, stdout, interactive).await
}

pub async fn ask_username<I, O>(input: &mut I, output: &mut O) -> Result<String>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        output.write_all(b"Enter your username: ").await?;
        output.flush().await?;

        line.clear();
        if input.read_line(&mut line).await? == 0 {
            bail!("input closed before a username was entered");
        }
        let name = line.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
}

/// A joined user with an open message stream, ready to run the duplex loop.
pub struct Session {
    config: ClientConfig,
    user: User,
    rpc: RpcClient,
    stream: MessageStream,
}

impl Session {
    pub async fn connect(config: ClientConfig, user: User) -> Result<Self> {
        let mut rpc = config.rpc();
        join_once(&mut rpc, &user)
            .await
            .with_context(|| format!("failed to join chat at {}", config.server))?;

        let stream = rpc
            .open_stream(&user)
            .await
            .context("failed to open message stream")?;

        Ok(Self {
            config,
            user,
            rpc,
            stream,
        })
    }

    /// Runs the listener and the sender side by side until the user leaves,
    /// input ends, or either side hits an unrecoverable error.
    pub async fn run<I, O>(self, input: I, output: O, interactive: bool) -> Result<()>
    where
        I: AsyncBufRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let Session {
            config,
            user,
            rpc,
            stream,
        } = self;

        let terminal = Arc::new(Mutex::new(Terminal::new(
            output,
            user.name.clone(),
            interactive,
        )));
        terminal.lock().await.line(WELCOME).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let listener = spawn_activity(
            listen(
                stream,
                config.rpc(),
                user.clone(),
                Arc::clone(&terminal),
                shutdown_rx.clone(),
            ),
            Arc::clone(&shutdown_tx),
        );
        let sender = spawn_activity(
            send_lines(
                input,
                rpc,
                user,
                terminal,
                Arc::clone(&shutdown_tx),
                shutdown_rx,
            ),
            shutdown_tx,
        );

        let (listened, sent) = tokio::join!(listener, sender);
        sent.context("sender task failed")??;
        listened.context("listener task failed")??;
        Ok(())
    }
}

/// Spawns `activity` and raises `shutdown` when it ends, whatever the reason,
/// so its sibling stops too.
fn spawn_activity<F>(activity: F, shutdown: Arc<watch::Sender<bool>>) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = activity.await;
        shutdown.send_replace(true);
        result
    })
}

type SharedTerminal<O> = Arc<Mutex<Terminal<O>>>;

async fn listen<O>(
    mut stream: MessageStream,
    mut rpc: RpcClient,
    user: User,
    terminal: SharedTerminal<O>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    O: AsyncWrite + Unpin,
{
    loop {
        let received = select! {
            _ = shutdown.changed() => return Ok(()),
            received = stream.recv() => received,
        };

        match received {
            Ok(message) => {
                if message.from.id != user.id {
                    terminal.lock().await.message(&message).await?;
                }
            }
            Err(_) if *shutdown.borrow() => return Ok(()),
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "lost message stream; reconnecting");
                stream = select! {
                    _ = shutdown.changed() => return Ok(()),
                    resumed = resume(&mut rpc, &user) => {
                        resumed.context("failed to re-establish message stream")?
                    }
                };
                info!("message stream re-established");
            }
            Err(err) => return Err(err).context("failed to receive message from server"),
        }
    }
}

/// Joins `user`, treating a rejection as already joined. User ids are
/// generated per session, so the only way the server can know this id is an
/// earlier attempt whose response was lost.
async fn join_once(rpc: &mut RpcClient, user: &User) -> Result<(), ClientError> {
    match rpc.join(user).await {
        Ok(joined) => info!("{joined}"),
        Err(ClientError::Rejected(reason)) => debug!(%reason, "server still knows this user"),
        Err(err) => return Err(err),
    }
    Ok(())
}

/// Re-joins after a lost stream and opens a new one.
async fn resume(rpc: &mut RpcClient, user: &User) -> Result<MessageStream, ClientError> {
    join_once(rpc, user).await?;
    rpc.open_stream(user).await
}

async fn send_lines<I, O>(
    mut input: I,
    mut rpc: RpcClient,
    user: User,
    terminal: SharedTerminal<O>,
    stop: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        terminal.lock().await.prompt().await?;

        line.clear();
        let read = select! {
            _ = shutdown.changed() => return Ok(()),
            Ok(()) = tokio::signal::ctrl_c() => 0,
            read = input.read_line(&mut line) => read.context("failed to read input")?,
        };

        let parsed = if read == 0 {
            debug!("input closed or interrupted");
            Input::Leave
        } else {
            Input::parse(&line)
        };

        match parsed {
            Input::Blank => continue,
            Input::Leave => {
                // Raised first so the listener treats the closing stream as expected.
                stop.send_replace(true);
                if let Err(err) = rpc.disconnect(&user).await {
                    warn!(error = %err, "failed to disconnect cleanly");
                }
                return Ok(());
            }
            Input::GetUsers => {
                let users = select! {
                    _ = shutdown.changed() => return Ok(()),
                    users = rpc.get_users() => users.context("failed to get user list")?,
                };
                terminal.lock().await.users(&users).await?;
            }
            Input::Chat(body) => {
                let message = ChatMessage::new(user.clone(), body);
                select! {
                    _ = shutdown.changed() => return Ok(()),
                    sent = rpc.send_message(message) => sent.context("failed to send message")?,
                }
            }
        }
    }
}

/// Renders chat output, redrawing the prompt when attached to a terminal.
pub struct Terminal<O> {
    output: O,
    name: String,
    interactive: bool,
}

impl<O> Terminal<O>
where
    O: AsyncWrite + Unpin,
{
    pub fn new(output: O, name: String, interactive: bool) -> Self {
        Self {
            output,
            name,
            interactive,
        }
    }

    pub async fn prompt(&mut self) -> io::Result<()> {
        if !self.interactive {
            return Ok(());
        }
        let prompt = format!("{}> ", self.name);
        self.output.write_all(prompt.as_bytes()).await?;
        self.output.flush().await
    }

    pub async fn message(&mut self, message: &ChatMessage) -> io::Result<()> {
        if self.interactive {
            self.output.write_all(CLEAR_LINE).await?;
        }
        self.line(&format!("{}> {}", message.from.name, message.body))
            .await?;
        self.prompt().await
    }

    pub async fn users(&mut self, users: &[User]) -> io::Result<()> {
        for user in users {
            self.line(&format!("\t{}", user.name)).await?;
        }
        Ok(())
    }

    pub async fn line(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await
    }
}
