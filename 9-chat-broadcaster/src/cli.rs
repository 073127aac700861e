use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections.
    Server(ServerArgs),
    /// Join a chat server and talk from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:9876")]
    pub listen: SocketAddr,

    /// How long one recipient may hold up a broadcast, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub delivery_timeout_ms: u64,

    /// Messages queued per connected client before deliveries to it time out.
    #[arg(long, default_value_t = 64)]
    pub stream_buffer: usize,

    /// How long a client may leave a pushed message unread before it is
    /// dropped, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub write_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name. Asked for on stdin when omitted.
    #[arg(long)]
    pub name: Option<String>,

    /// Address of the chat server.
    #[arg(long, default_value = "127.0.0.1:9876")]
    pub server: SocketAddr,

    /// Timeout for each request to the server, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub send_timeout_ms: u64,

    /// Retries after a connection failure before giving up.
    #[arg(long, default_value_t = 4)]
    pub max_retries: u32,

    /// First retry delay in milliseconds; doubles on each further retry.
    #[arg(long, default_value_t = 100)]
    pub initial_backoff_ms: u64,
}
