use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use framewire::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ClientHandler,
    FramewireConfig, RawCodec, Server, ServerHandler, Session,
};
use parking_lot::Mutex;
use tokio::runtime;
use tokio::sync::oneshot;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// also write hourly rolling log files into this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a server that relays every message to all open connections
    Serve,
    /// Send one message and print the first reply
    Send {
        /// server address, defaults to client.server_address
        #[arg(short, long)]
        address: Option<String>,
        #[arg(long, default_value_t = 1)]
        handler_id: u32,
        /// seconds to wait for a reply
        #[arg(long, default_value_t = 5)]
        wait: u64,
        message: String,
    },
    PrintConfig,
}

struct RelayHandler;

impl ServerHandler<Bytes> for RelayHandler {
    fn on_read(&self, session: &Session<Bytes>, handler_id: u32, message: Bytes) {
        match session.write_to_all(handler_id, &message) {
            Ok(delivered) => info!(
                "relayed {} bytes from connection {} to {} connections",
                message.len(),
                session.id(),
                delivered
            ),
            Err(err) => error!("relay from connection {} failed: {}", session.id(), err),
        }
    }
}

struct ReplyHandler {
    reply_tx: Mutex<Option<oneshot::Sender<(u32, Bytes)>>>,
}

impl ClientHandler<Bytes> for ReplyHandler {
    fn on_read(&self, handler_id: u32, message: Bytes) {
        if let Some(reply_tx) = self.reply_tx.lock().take() {
            let _ = reply_tx.send((handler_id, message));
        }
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();
    if commandline.verbose > 0 && std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = FramewireConfig::set_up_config(config_path)?;

    let _worker_guard = match &commandline.log_dir {
        Some(log_dir) => Some(setup_tracing(log_dir)?),
        None => {
            setup_local_tracing()?;
            None
        }
    };

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    match commandline.command.unwrap_or(Command::Serve) {
        Command::Serve => rt.block_on(serve(config)),
        Command::Send {
            address,
            handler_id,
            wait,
            message,
        } => rt.block_on(send(config, address, handler_id, Duration::from_secs(wait), message)),
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

async fn serve(config: FramewireConfig) -> AppResult<()> {
    let server = Server::new(config.server, RawCodec, RelayHandler)?;
    let listener = server.listen().await?;

    let signal_server = server.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
            return;
        }
        info!("received ctrl-c, shutting down");
        signal_server.shutdown();
    });

    server.serve(listener).await
}

async fn send(
    config: FramewireConfig,
    address: Option<String>,
    handler_id: u32,
    wait: Duration,
    message: String,
) -> AppResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let handler = ReplyHandler {
        reply_tx: Mutex::new(Some(reply_tx)),
    };
    let address = address.unwrap_or_else(|| config.client.server_address.clone());
    let client = Client::new(config.client, RawCodec, handler)?;
    client.connect(address.as_str()).await?;
    client.send(handler_id, &Bytes::from(message))?;

    let reply = tokio::time::timeout(wait, reply_rx).await;
    client.disconnect();
    match reply {
        Ok(Ok((handler_id, payload))) => {
            println!("[{}] {}", handler_id, String::from_utf8_lossy(&payload));
            Ok(())
        }
        Ok(Err(_)) => Err(AppError::NotConnected),
        Err(_) => Err(AppError::IllegalStateError(format!(
            "no reply within {:?}",
            wait
        ))),
    }
}
