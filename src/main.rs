use anyhow::Context;
use std::sync::Arc;
use tempsim::{
    handlers::{self, HandlerContext, PassthroughRelay},
    BatchId, Config, ConfigStore, EmitLoop, MqttDeviceClient, RandomWalkGenerator, ResetLatch,
    RuntimeConfig,
};
use tokio::{signal, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tempsim::init_tracing();

    info!(
        "tempsim v{} starting (built {} with {})",
        tempsim::VERSION,
        tempsim::BUILD_TIMESTAMP,
        tempsim::RUST_VERSION
    );

    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => {
            info!("No configuration file given, using built-in defaults");
            Config::default()
        }
    };
    config.apply_env().context("applying environment overrides")?;
    config.validate().context("invalid configuration")?;

    let store = ConfigStore::new(RuntimeConfig::try_from(&config.runtime)?);
    let reset = ResetLatch::new();
    let cancel = CancellationToken::new();

    info!(
        host = %config.mqtt.host,
        port = config.mqtt.port,
        client_id = %config.mqtt.client_id(),
        "Connecting to MQTT broker"
    );
    let (client, mut pump) = MqttDeviceClient::new(&config.mqtt)?;
    pump.connect()
        .await
        .context("initial broker connection failed")?;
    let client = Arc::new(client);

    let (event_tx, event_rx) = mpsc::channel(64);
    let pump_task = tokio::spawn(pump.run(event_tx, cancel.clone()));

    if config.runtime.bootstrap_from_twin {
        if let Err(e) = handlers::bootstrap_from_twin(&store, client.as_ref()).await {
            warn!("Could not read twin, keeping configured values: {}", e);
        }
    }

    let initial = store.snapshot();
    info!(
        send_data = initial.send_enabled,
        send_interval_secs = initial.send_interval_secs(),
        "Initial values"
    );

    let ctx = HandlerContext {
        store: store.clone(),
        reset: reset.clone(),
        relay: PassthroughRelay::new(config.mqtt.passthrough_output.clone()),
        passthrough_input: config.mqtt.passthrough_input.clone(),
    };
    let dispatcher = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { handlers::dispatch(&ctx, client.as_ref(), event_rx, cancel).await })
    };

    let emitter = EmitLoop::new(
        config.simulator.clone(),
        RandomWalkGenerator::from_entropy(),
        store,
        reset,
        BatchId::new(),
        config.mqtt.telemetry_output.clone(),
    )
    .with_max_messages(config.runtime.max_messages);

    let emit_task = {
        let client = client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { emitter.run(client.as_ref(), cancel).await })
    };

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Received shutdown signal");
    cancel.cancel();

    let stats = emit_task.await.context("emit loop panicked")?;
    join_logged("event dispatcher", dispatcher).await;
    join_logged("MQTT event pump", pump_task).await;

    info!(
        "Final stats: {} sent, {} publish errors, {} resets, {} ticks",
        stats.sent, stats.publish_errors, stats.resets_applied, stats.ticks
    );

    Ok(())
}

/// Wait for a background task, logging a panic or abort instead of dropping it
async fn join_logged(name: &str, task: JoinHandle<()>) -> bool {
    match task.await {
        Ok(()) => true,
        Err(e) => {
            warn!("{} task failed: {}", name, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_reports_failed_tasks() {
        assert!(join_logged("clean", tokio::spawn(async {})).await);

        let panicked = tokio::spawn(async { panic!("pump crashed") });
        assert!(!join_logged("panicking", panicked).await);

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(!join_logged("aborted", aborted).await);
    }
}
