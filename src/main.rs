use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webhook_endpoint::config::{EndpointConfig, StorageBackend};
use webhook_endpoint::delivery::LoggingConsumer;
use webhook_endpoint::endpoint::{EndpointBuilder, EndpointError};
use webhook_endpoint::storage::{MemoryStorage, SpoolStorage, StorageProvider};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webhook_endpoint=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Webhook endpoint stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), EndpointError> {
    let config = EndpointConfig::from_env()?;

    match StorageBackend::from_env()? {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; batches are lost on restart");
            serve(MemoryStorage::new(), config).await
        }
        StorageBackend::Spool(dir) => serve(SpoolStorage::open(dir)?, config).await,
    }
}

async fn serve<S: StorageProvider>(storage: S, config: EndpointConfig) -> Result<(), EndpointError> {
    let listener = TcpListener::bind(config.listen_addr).await?;

    let mut endpoint = EndpointBuilder::new()
        .storage(storage)
        .config(config)
        .build()?;
    endpoint.spawn_delivery(LoggingConsumer::new())?;

    let shutdown = endpoint.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; shutting down");
            shutdown.cancel();
        }
    });

    endpoint.serve(listener).await
}
