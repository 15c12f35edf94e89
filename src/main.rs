//! CLI for ChatHub
//!
//! Subcommands:
//! - `server`: run the broadcast hub
//! - `client`: connect, subscribe, send one chat message and print what comes
//!   back (useful for smoke tests)

use std::process::ExitCode;
use std::sync::Arc;

use chathub::broker::Broker;
use chathub::client::HubClient;
use chathub::config::{Settings, load_config};
use chathub::transport::websocket::start_websocket_server;
use chathub::utils::{HubError, logging};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "chathub")]
enum Command {
    /// Start the broadcast hub
    Server,
    /// Run the smoke-test client (connect, subscribe, send, disconnect)
    Client {
        /// WebSocket URL (default: built from the server settings)
        #[arg(long)]
        url: Option<String>,
        /// Origin header to present (default: first allowed origin)
        #[arg(long)]
        origin: Option<String>,
        #[arg(long, default_value = "cli")]
        sender: String,
        #[arg(long, default_value = "Hello from chathub")]
        content: String,
        /// Destination to send to
        #[arg(long, default_value = "/app/sendMessage")]
        destination: String,
        /// Topic to subscribe to before sending
        #[arg(long, default_value = "/topic/messages")]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Server => run_server(settings).await,
        Command::Client {
            url,
            origin,
            sender,
            content,
            destination,
            topic,
        } => {
            let url = url.unwrap_or_else(|| {
                format!("ws://{}{}", settings.listen_addr(), settings.server.path)
            });
            let origin = origin
                .or_else(|| settings.server.allowed_origins.first().cloned())
                .unwrap_or_else(|| "http://localhost".to_string());
            run_client(&url, &origin, &topic, &destination, &sender, &content).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<(), HubError> {
    let broker = Arc::new(Broker::new(&settings.hub)?);
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, closing connections.");
        }
        signal.cancel();
    });

    start_websocket_server(broker, settings, shutdown).await
}

async fn run_client(
    url: &str,
    origin: &str,
    topic: &str,
    destination: &str,
    sender: &str,
    content: &str,
) -> Result<(), HubError> {
    let mut client = HubClient::connect(url, origin).await?;
    println!(
        "Connected (version {}, session {})",
        client.version().unwrap_or("?"),
        client.session().unwrap_or("?")
    );

    client.subscribe(topic).await?;
    client.send_chat(destination, sender, content).await?;

    if let Some(frame) = client.next_message().await? {
        println!(
            "{}: {}",
            frame.get("destination").unwrap_or(topic),
            frame.body
        );
    }

    client.disconnect().await?;
    Ok(())
}
