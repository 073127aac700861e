use std::{io::IsTerminal, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use chat_broadcaster::{
    cli::{Cli, Command, ServerArgs},
    client,
    hub::HubConfig,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => {
            let code = match client::run(args).await {
                Ok(()) => 0,
                Err(err) => {
                    error!("client terminated: {err:#}");
                    1
                }
            };
            // A pending stdin read would otherwise keep the runtime from shutting down.
            std::process::exit(code);
        }
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen).await?;
    let server = Server::new(
        listener,
        HubConfig {
            delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
            stream_buffer: args.stream_buffer,
            write_timeout: Duration::from_millis(args.write_timeout_ms),
        },
    );
    let addr = server.local_addr()?;
    info!("server listening on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
