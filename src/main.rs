use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use tidemq::broker::Broker;
use tidemq::client::{Client, ClientInfo};
use tidemq::config::load_config;
use tidemq::protocol::{Message, SubscribeMode};
use tidemq::transport::Server;
use tidemq::utils::logging;

#[derive(Parser, Debug)]
#[command(name = "tidemq", version, about = "Lightweight publish/subscribe broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker until Ctrl-C
    Server,
    /// Publish one message
    Publish {
        #[arg(long, default_value = "127.0.0.1:4742")]
        addr: String,
        #[arg(long)]
        queue: String,
        payload: String,
    },
    /// Subscribe and print received payloads until Ctrl-C
    Listen {
        #[arg(long, default_value = "127.0.0.1:4742")]
        addr: String,
        #[arg(long)]
        queue: String,
        /// Keep the subscription across disconnects and restarts
        #[arg(long)]
        permanent: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Publish {
            addr,
            queue,
            payload,
        } => publish(&addr, &queue, payload).await,
        Command::Listen {
            addr,
            queue,
            permanent,
        } => listen(&addr, &queue, permanent).await,
    };

    if let Err(e) = result {
        error!(error = %e, "exiting");
        std::process::exit(1);
    }
}

async fn run_server(settings: tidemq::config::Settings) -> tidemq::Result<()> {
    let broker = Arc::new(Broker::from_settings(&settings.broker));
    broker.restore()?;

    let server = Server::bind(&settings, broker).await?;
    info!(addr = %server.local_addr()?, "tidemq broker started");
    server.run_until_ctrl_c().await?;
    Ok(())
}

async fn publish(addr: &str, queue: &str, payload: String) -> tidemq::Result<()> {
    let client = Client::connect(addr, ClientInfo::new("tidemq-cli", "publish")).await?;
    let content = client.publish(queue, payload.into_bytes()).await?;
    info!(queue = %queue, conversation = %content.header.conversation_id, "published");
    client.close().await?;
    Ok(())
}

async fn listen(addr: &str, queue: &str, permanent: bool) -> tidemq::Result<()> {
    let client = Client::connect(addr, ClientInfo::new("tidemq-cli", "listen")).await?;
    client.listen(|message| {
        if let Message::Content(content) = message {
            println!(
                "[{}] {}",
                content.header.queue_name,
                String::from_utf8_lossy(&content.payload)
            );
        }
    });

    let mode = if permanent {
        SubscribeMode::PermanentConsumer
    } else {
        SubscribeMode::TemporaryConsumer
    };
    client.subscribe(queue, mode).await?;
    info!(queue = %queue, ?mode, "listening, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    client.close().await?;
    Ok(())
}
