use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use spam_pipeline::config::PipelineConfig;
use spam_pipeline::pipeline::spam_pipeline;
use spam_pipeline::services::{SimulatedConfig, SimulatedServices};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries only result lines.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let simulated = SimulatedConfig::from_env().context("invalid simulated service configuration")?;

    tracing::info!(
        queue_capacity = config.queue_capacity,
        max_batch_size = config.max_batch_size,
        worker_count = config.worker_count,
        resolver_workers = config.resolver_workers,
        call_timeout = ?config.call_timeout,
        "Starting spam pipeline"
    );

    let services = Arc::new(SimulatedServices::new(simulated));
    let (input, pipeline, output) =
        spam_pipeline(&config, services.clone(), services.clone(), services).build();

    // Ctrl-C aborts the run instead of leaving it hanging.
    let cancel = pipeline.cancel_token();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling pipeline");
                cancel.cancel();
            }
        }
    });

    let feed = async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut sent = 0usize;
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line.context("failed to read stdin")?,
            };
            let Some(line) = line else { break };
            let identifier = line.trim();
            if identifier.is_empty() {
                continue;
            }
            if input
                .send_until(identifier.to_string(), &cancel)
                .await
                .is_err()
            {
                break;
            }
            sent += 1;
        }
        tracing::debug!(sent, "Input closed");
        anyhow::Ok(())
    };

    let drain = async move {
        let mut stdout = tokio::io::stdout();
        let mut written = 0usize;
        while let Some(line) = output.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            written += 1;
        }
        stdout.flush().await?;
        anyhow::Ok(written)
    };

    let (fed, ran, written) = tokio::join!(feed, pipeline.run(), drain);
    ran.context("pipeline run failed")?;
    fed?;
    let written = written.context("failed to write output")?;

    tracing::info!(lines = written, "Done");
    Ok(())
}
