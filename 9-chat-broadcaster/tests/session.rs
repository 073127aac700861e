use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use chat_broadcaster::{
    client::{ClientConfig, Session, WELCOME},
    connection::{Connection, MessageStream, RpcClient},
    hub::{ChatHub, HubConfig},
    message::{ChatMessage, User},
    retry::RetryPolicy,
    server::Server,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream},
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(3);

async fn start_server() -> Result<(SocketAddr, ChatHub, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = Server::new(listener, HubConfig::default());
    let addr = server.local_addr()?;
    let hub = server.hub().clone();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });

    Ok((addr, hub, shutdown_tx))
}

fn quick_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            multiplier: 2,
        },
        ..ClientConfig::new(addr)
    }
}

async fn wait_for_stream(hub: &ChatHub, user_id: &str) -> Result<()> {
    timeout(WAIT, async {
        while !hub.registry().contains(user_id).await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("{user_id} never opened a stream"))
}

/// A session driven through in-memory pipes instead of a terminal.
struct Driven {
    input: DuplexStream,
    output: BufReader<DuplexStream>,
    task: JoinHandle<Result<()>>,
}

impl Driven {
    async fn start(addr: SocketAddr, hub: &ChatHub, user: User) -> Result<Self> {
        let session = Session::connect(quick_config(addr), user.clone()).await?;
        wait_for_stream(hub, &user.id).await?;

        let (input, session_input) = tokio::io::duplex(4096);
        let (session_output, output) = tokio::io::duplex(64 * 1024);

        let task = tokio::spawn(session.run(BufReader::new(session_input), session_output, false));
        let mut driven = Self {
            input,
            output: BufReader::new(output),
            task,
        };
        assert_eq!(driven.read_line().await?, WELCOME);
        Ok(driven)
    }

    async fn type_line(&mut self, line: &str) -> Result<()> {
        self.input.write_all(line.as_bytes()).await?;
        self.input.write_all(b"\n").await?;
        self.input.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let bytes = timeout(WAIT, self.output.read_line(&mut line)).await??;
        if bytes == 0 {
            return Err(anyhow!("session output closed"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Reads until a line that is not a system announcement.
    async fn read_chat_line(&mut self) -> Result<String> {
        loop {
            let line = self.read_line().await?;
            if !line.starts_with("SYSTEM> ") {
                return Ok(line);
            }
        }
    }

    async fn finish(self) -> Result<()> {
        timeout(WAIT, self.task).await??
    }
}

async fn observer(addr: SocketAddr, hub: &ChatHub, user: &User) -> Result<(RpcClient, MessageStream)> {
    let mut rpc = RpcClient::new(addr, Duration::from_secs(1), RetryPolicy::never());
    rpc.join(user).await?;
    let stream = Connection::dial(addr).await?.open_stream(user).await?;
    wait_for_stream(hub, &user.id).await?;
    Ok((rpc, stream))
}

async fn next_chat(stream: &mut MessageStream) -> Result<ChatMessage> {
    loop {
        let message = timeout(WAIT, stream.recv()).await??;
        if !message.from.is_system() {
            return Ok(message);
        }
    }
}

async fn next_system(stream: &mut MessageStream) -> Result<String> {
    loop {
        let message = timeout(WAIT, stream.recv()).await??;
        if message.from.is_system() {
            return Ok(message.body);
        }
    }
}

#[tokio::test]
async fn typed_lines_reach_others_and_own_messages_are_not_echoed() -> Result<()> {
    let (addr, hub, shutdown) = start_server().await?;
    let bob = User::new("b", "bob");
    let (mut bob_rpc, mut bob_stream) = observer(addr, &hub, &bob).await?;

    let alice = User::new("a", "alice");
    let mut session = Driven::start(addr, &hub, alice.clone()).await?;
    assert_eq!(next_system(&mut bob_stream).await?, "alice joined the chat");

    session.type_line("").await?;
    session.type_line("   ").await?;
    session.type_line("hello bob").await?;
    let heard = next_chat(&mut bob_stream).await?;
    assert_eq!(heard.from, alice);
    assert_eq!(heard.body, "hello bob");

    bob_rpc.send_message(ChatMessage::new(bob.clone(), "hi alice")).await?;
    assert_eq!(session.read_chat_line().await?, "bob> hi alice");

    session.type_line("/leave").await?;
    session.finish().await?;
    assert_eq!(next_system(&mut bob_stream).await?, "alice left the chat");

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn getusers_is_answered_locally_in_join_order() -> Result<()> {
    let (addr, hub, shutdown) = start_server().await?;
    let bob = User::new("b", "bob");
    let (_bob_rpc, mut bob_stream) = observer(addr, &hub, &bob).await?;

    let mut session = Driven::start(addr, &hub, User::new("a", "alice")).await?;
    session.type_line("/getusers").await?;

    assert_eq!(session.read_chat_line().await?, "\tbob");
    assert_eq!(session.read_line().await?, "\talice");

    session.type_line("after listing").await?;
    assert_eq!(next_chat(&mut bob_stream).await?.body, "after listing");

    session.type_line("/leave").await?;
    session.finish().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn closed_input_leaves_the_chat() -> Result<()> {
    let (addr, hub, shutdown) = start_server().await?;
    let bob = User::new("b", "bob");
    let (_bob_rpc, mut bob_stream) = observer(addr, &hub, &bob).await?;

    let session = Driven::start(addr, &hub, User::new("a", "alice")).await?;
    let Driven { input, output, task } = session;
    drop(input);

    timeout(WAIT, task).await???;
    assert_eq!(next_system(&mut bob_stream).await?, "alice joined the chat");
    assert_eq!(next_system(&mut bob_stream).await?, "alice left the chat");
    assert!(hub.users().await.iter().all(|user| user.id != "a"));

    drop(output);
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn listener_reconnects_after_losing_its_stream() -> Result<()> {
    let (addr, hub, shutdown) = start_server().await?;
    let bob = User::new("b", "bob");
    let (mut bob_rpc, _bob_stream) = observer(addr, &hub, &bob).await?;

    let mut session = Driven::start(addr, &hub, User::new("a", "alice")).await?;
    let before = hub.registry().snapshot().await;
    let old_stream = before
        .iter()
        .find(|(id, _)| id == "a")
        .map(|(_, handle)| handle.id())
        .ok_or_else(|| anyhow!("alice has no stream"))?;

    // Dropping the entry closes the server side of alice's stream.
    hub.registry().unregister("a").await;

    timeout(WAIT, async {
        loop {
            let reopened = hub
                .registry()
                .snapshot()
                .await
                .into_iter()
                .any(|(id, handle)| id == "a" && handle.id() != old_stream);
            if reopened {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    bob_rpc.send_message(ChatMessage::new(bob.clone(), "welcome back")).await?;
    assert_eq!(session.read_chat_line().await?, "bob> welcome back");

    session.type_line("/leave").await?;
    session.finish().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn connecting_when_the_server_already_lists_the_user_still_streams() -> Result<()> {
    let (addr, hub, shutdown) = start_server().await?;
    let bob = User::new("b", "bob");
    let (mut bob_rpc, _bob_stream) = observer(addr, &hub, &bob).await?;

    // As if an earlier join landed but its response never arrived.
    let alice = User::new("a", "alice");
    hub.join(alice.clone()).await?;

    let mut session = Driven::start(addr, &hub, alice).await?;
    let ids: Vec<_> = hub.users().await.into_iter().map(|user| user.id).collect();
    assert_eq!(ids, ["b", "a"]);

    bob_rpc.send_message(ChatMessage::new(bob.clone(), "you made it")).await?;
    assert_eq!(session.read_chat_line().await?, "bob> you made it");

    session.type_line("/leave").await?;
    session.finish().await?;
    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn lost_server_terminates_the_session_with_an_error() -> Result<()> {
    let (addr, hub, shutdown) = start_server().await?;
    let session = Driven::start(addr, &hub, User::new("a", "alice")).await?;

    let _ = shutdown.send(());

    let outcome = timeout(WAIT, session.task).await??;
    assert!(outcome.is_err());
    Ok(())
}
