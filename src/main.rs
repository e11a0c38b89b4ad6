use anyhow::Context;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

use ws_listener::config::{Settings, DEFAULT_HOST, DEFAULT_PORT};
use ws_listener::server::Server;
use ws_listener::shutdown::ShutdownSignal;

#[derive(Parser, Debug)]
struct Cli {
    /// Host to bind to
    #[clap(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Send every received message back to the client
    #[clap(long)]
    pub echo: bool,

    #[clap(flatten)]
    verbose: Verbosity<InfoLevel>,
}

impl From<&Cli> for Settings {
    fn from(cli: &Cli) -> Self {
        Settings {
            host: cli.host.clone(),
            port: cli.port,
            echo: cli.echo,
        }
    }
}

fn convert_level_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli: Cli = Cli::parse();

    let subscriber_stdout = tracing_subscriber::fmt::layer()
        .with_filter(convert_level_filter(cli.verbose.log_level_filter()));
    tracing_subscriber::registry()
        .with(subscriber_stdout)
        .try_init()?;

    let settings = Settings::from(&cli);
    let shutdown = ShutdownSignal::install().context("Unable to install signal handlers")?;
    let listener = TcpListener::bind(settings.bind_address())
        .await
        .with_context(|| format!("Unable to bind {}:{}", settings.host, settings.port))?;

    let server = Server::new(listener, settings);
    info!(
        "WebSocket server started on ws://{}. Press Ctrl+C to stop.",
        server.local_addr()?
    );
    server.run_until(shutdown.recv()).await;
    info!("Server stopped.");

    Ok(())
}
