#![crate_name = "cell_orchestrator"]

pub mod aas;
pub mod bt;
pub mod config;
pub mod error;
pub mod interface_cache;
pub mod mqtt;
pub mod packml;

use aas::client::AasClient;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use config::OrchestratorConfig;
use interface_cache::InterfaceCache;
use mqtt::client::MqttConnection;
use mqtt::distributor::MessageDistributor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Behavior-tree orchestrator for a distributed manufacturing cell.
#[derive(Parser, Debug)]
#[command(name = "cell-orchestrator")]
struct Cli {
    /// Path to config.yaml. Defaults to the platform config directory.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the node registration XML (for Groot2) and exit.
    #[arg(short = 'g', long = "generate-xml-models")]
    generate_xml_models: bool,
}

fn main() -> Result<()> {
    setup()?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = OrchestratorConfig::load(cli.config.as_deref()).await?;

    if cli.generate_xml_models {
        return generate_xml_models(&config);
    }

    let aas_client = Arc::new(AasClient::new(
        config.aas.server_url.clone(),
        config.aas.registry_url.clone(),
    ));
    let interface_cache = Arc::new(InterfaceCache::new(aas_client.clone()));
    let distributor = Arc::new(MessageDistributor::new());

    let connection = MqttConnection::create(&config.mqtt.broker_uri, &config.mqtt.client_id).connect();
    let (mqtt_client, event_loop_handle) = connection.spawn(distributor.clone());

    let controller = packml::Controller::new(
        config,
        mqtt_client,
        distributor,
        aas_client,
        interface_cache,
    );
    controller.arm_command_channel().await?;

    let run_handle = tokio::spawn(controller.clone().run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            controller.request_shutdown();
        }
        result = event_loop_handle => {
            if let Err(e) = result {
                error!(error = %e, "MQTT event loop task ended unexpectedly");
            }
        }
    }

    if let Err(e) = run_handle.await {
        error!(error = %e, "controller run loop ended unexpectedly");
    }

    Ok(())
}

fn generate_xml_models(config: &OrchestratorConfig) -> Result<()> {
    let xml = packml::controller::node_registration_xml();
    std::fs::write(&config.behavior_tree.nodes_path, xml).map_err(|e| {
        eyre!(
            "failed to write node registration XML to {}: {e}",
            config.behavior_tree.nodes_path.display()
        )
    })?;
    info!(path = %config.behavior_tree.nodes_path.display(), "wrote node registration XML");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
