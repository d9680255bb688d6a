use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{error, info};

use bridgemail::config::{Config, DEFAULT_POP3_PORT, DEFAULT_SMTP_PORT};
use bridgemail::{Server, Store};

#[derive(Parser, Debug)]
#[command(name = "bridgemail", version, about = "A local-only SMTP / POP3 mail service")]
struct Args {
    /// SMTP listening port
    #[arg(short = 's', value_name = "smtp_port", default_value_t = DEFAULT_SMTP_PORT)]
    smtp_port: u16,

    /// POP3 listening port
    #[arg(short = 'p', value_name = "pop3_port", default_value_t = DEFAULT_POP3_PORT)]
    pop3_port: u16,

    /// Path to the provisioned mailbox database
    #[arg(value_name = "path-to-store")]
    store: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = Config::new(args.smtp_port, args.pop3_port, args.store);

    let store = Arc::new(Store::open(&config.store_path)?);
    let server = Server::bind(&config, store).await?;

    info!(
        "bridgemail ready: smtp on port {}, pop3 on port {}, store {}",
        config.smtp_port,
        config.pop3_port,
        config.store_path.display()
    );

    server.run(shutdown_signal()).await
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received interrupt, exiting"),
            _ = term.recv() => info!("received termination signal, exiting"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt, exiting");
    }
}
