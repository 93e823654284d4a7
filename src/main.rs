use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use nanoclaw::buffer::SensorBuffer;
use nanoclaw::config::Config;
use nanoclaw::gateway::{self, Gateway};
use nanoclaw::{cli, http, upload};
use std::sync::Arc;
use tokio::net::TcpListener;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,nanoclaw=info,tower_http=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "failed to bind nanoclaw listener on {addr}: port already in use; \
                 re-run with --port to choose another port"
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind nanoclaw listener on {addr}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = Config::from_env()?;
    init_tracing()?;

    let buffer = Arc::new(
        SensorBuffer::new(config.buffer_max_size, config.batch_threshold)
            .with_offline_capacity(config.offline_queue_max_batches),
    );
    let uploader = upload::from_config(&config)?;
    let gateway = Arc::new(Gateway::new(
        config.gateway_id.clone(),
        buffer,
        uploader,
        config.upload_timeout,
    ));

    tracing::info!(
        gateway_id = %config.gateway_id,
        max_size = config.buffer_max_size,
        threshold = config.batch_threshold,
        offline_queue_max_batches = config.offline_queue_max_batches,
        "NanoClaw L2 gateway starting"
    );

    let mut batch_handle = if config.auto_batch {
        Some(tokio::spawn(gateway::run_batch_scheduler(
            gateway.clone(),
            config.batch_poll_interval,
            config.batch_interval,
        )))
    } else {
        tracing::info!("automatic batch upload disabled; use POST /batch");
        None
    };
    let mut retry_handle = tokio::spawn(gateway::run_retry_scheduler(
        gateway.clone(),
        config.retry_interval,
    ));

    let bind = args.bind_addr();
    let listener = bind_listener(&bind).await?;
    let app = http::router(http::HttpState {
        gateway: gateway.clone(),
    });
    tracing::info!(bind=%bind, "waiting for edge node reports");
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = http_handle => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server exited"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
            }
        }
        _ = async {
            if let Some(handle) = batch_handle.as_mut() {
                if let Err(err) = handle.await {
                    tracing::error!(error=%err, "batch scheduler task failed");
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        res = &mut retry_handle => {
            if let Err(err) = res {
                tracing::error!(error=%err, "retry scheduler task failed");
            }
        }
    }

    if let Some(handle) = batch_handle {
        handle.abort();
    }
    retry_handle.abort();

    let status = gateway.status();
    if status.ingest_count > 0 || status.offline_count > 0 {
        tracing::warn!(
            buffered = status.ingest_count,
            offline = status.offline_count,
            "exiting with undelivered readings; in-memory data is lost on restart"
        );
    }

    Ok(())
}
