use anyhow::Context;
use clap::Parser;
use coordinator::{DispatchEngine, RandomOrderIds};
use kitchen_shared::broker::{MqttBroker, SharedBroker};
use kitchen_shared::cli::ConnectionArgs;
use kitchen_shared::{topics, QoS, Session};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Sends a new order to every kitchen robot that reports idle
#[derive(Parser, Debug)]
#[command(name = "coordinator", version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(cli.connection.verbosity.level_filter().into()))
        .init();

    let config = cli.connection.broker_config()?;

    let (broker, events) = MqttBroker::connect(&config)
        .await
        .context("connecting to broker")?;
    let broker: SharedBroker = Arc::new(broker);
    let session = Session::new(broker.clone(), events);

    info!("Subscribing to topic '{}'...", topics::SHADOW_UPDATE_ACCEPTED_ALL);
    let updates = session
        .subscribe(topics::SHADOW_UPDATE_ACCEPTED_ALL, QoS::AtMostOnce)
        .await
        .context("subscribing to shadow updates")?;

    let engine = DispatchEngine::new(broker.clone(), RandomOrderIds::new());
    tokio::spawn(engine.run(updates));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Disconnecting...");
            if let Err(e) = broker.disconnect().await {
                error!("Disconnect failed: {}", e);
            }
        }
    });

    session.run().await?;
    Ok(())
}
