mod orders;
mod simulator;


use anyhow::Context;
use clap::Parser;
use kitchen_shared::broker::{MqttBroker, SharedBroker};
use kitchen_shared::cli::ConnectionArgs;
use kitchen_shared::{timing, topics, QoS, Session};
use simulator::{SimulatorConfig, WorkSimulator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Simulated kitchen robot: works dispatched orders and reports its shadow
#[derive(Parser, Debug)]
#[command(name = "robot", version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// The name assigned to this robot
    #[arg(long)]
    thing_name: String,

    /// Milliseconds between busy heartbeats
    #[arg(long, default_value_t = timing::STEP_INTERVAL_MS)]
    step_interval_ms: u64,
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
    info!("Robot starting: {}", cli.thing_name);

    let (broker, events) = MqttBroker::connect(&config)
        .await
        .context("connecting to broker")?;
    let broker: SharedBroker = Arc::new(broker);
    let session = Session::new(broker.clone(), events);

    let order_topic = topics::process_order(&cli.thing_name);
    info!("Subscribing to topic '{}'...", order_topic);
    let deliveries = session
        .subscribe(&order_topic, QoS::AtMostOnce)
        .await
        .context("subscribing to orders")?;

    let sim_config = SimulatorConfig {
        thing_name: cli.thing_name.clone(),
        step_interval: Duration::from_millis(cli.step_interval_ms),
        ..Default::default()
    };
    let (simulator, slot) = WorkSimulator::new(sim_config, broker.clone());
    tokio::spawn(orders::run_intake(deliveries, slot));
    let simulator_handle = tokio::spawn(simulator.run());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Disconnecting...");
            if let Err(e) = broker.disconnect().await {
                error!("Disconnect failed: {}", e);
            }
        }
    });

    let result = session.run().await;
    simulator_handle.abort();
    result?;
    Ok(())
}
