use clap::Parser;
use crackhash_core::telemetry::{TelemetryProviders, init_telemetry};
use crackhash_worker::{
    client::ManagerClient,
    config::{CliArgs, WorkerConfig},
    consumer::TaskConsumer,
    engine::ComputeEngine,
    http,
    service::WorkerService,
};
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = WorkerConfig::try_from(args)?;

    let providers = init_telemetry("crackhash-worker")?;

    let service = WorkerService::new(ComputeEngine::new(config.num_workers)?);
    let client = ManagerClient::new(config.manager_url.clone(), config.report_timeout)?;

    let consumer = if config.disable_queue {
        tracing::info!("Broker consumption disabled, serving the HTTP path only");
        None
    } else {
        let transport = config.broker.connect_amqp();
        let consumer = TaskConsumer::new(transport.clone(), service.clone());
        let token = consumer.shutdown_token();
        let handle = tokio::spawn(async move {
            consumer.run().await;
            transport.shutdown().await;
        });
        Some((token, handle))
    };

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, http::router(service, client))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    finish(consumer, providers).await;
    Ok(())
}

fn log_startup_info(config: &WorkerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting worker on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting worker on {} with {} compute threads",
            config.server_addr,
            config.num_workers
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

async fn finish(
    consumer: Option<(CancellationToken, JoinHandle<()>)>,
    providers: TelemetryProviders,
) {
    // 1. Stop consuming; an in-flight task finishes first
    if let Some((token, handle)) = consumer {
        token.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Task consumer panicked: {e}");
        }
    }
    tracing::info!("Worker shut down successfully");

    // 2. Flush telemetry
    providers.shutdown();
}
