use clap::Parser;
use crackhash_core::telemetry::{TelemetryProviders, init_telemetry};
use crackhash_manager::{
    config::{CliArgs, DispatchConfig, ManagerConfig, StoreConfig},
    http,
    queue::{BrokerTaskQueue, HttpTaskQueue, TaskQueue},
    service::ManagerService,
    store::{RequestStore, memory::MemoryStore, mongo::MongoStore},
};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ManagerConfig::try_from(args)?;

    let providers = init_telemetry("crackhash-manager")?;

    let store: Arc<dyn RequestStore> = match &config.store {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::Mongo {
            uri,
            database,
            op_timeout,
        } => Arc::new(MongoStore::connect(uri, database, *op_timeout).await?),
    };
    let queue: Arc<dyn TaskQueue> = match &config.dispatch {
        DispatchConfig::Broker(broker) => Arc::new(BrokerTaskQueue::new(broker.connect_amqp())),
        DispatchConfig::Http {
            worker_urls,
            timeout,
        } => Arc::new(HttpTaskQueue::new(worker_urls.clone(), *timeout)?),
    };
    let service = ManagerService::new(config.service.clone(), store, queue);
    service.start();

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, http::router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    finish(service, providers).await;
    Ok(())
}

fn log_startup_info(config: &ManagerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting manager on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting manager on {} (timeout {:?}, max queue size {}, {} parts per request)",
            config.server_addr,
            config.service.response_timeout,
            config.service.max_queue_size,
            config.service.part_count
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}

async fn finish(service: ManagerService, providers: TelemetryProviders) {
    // 1. Stop the background loops and close the broker connection
    service.shutdown().await;
    tracing::info!("Manager shut down successfully");

    // 2. Flush telemetry
    providers.shutdown();
}
