use ocppg::{Gateway, GatewayConfig, GatewayEvent};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ocppg=debug")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    let runtime = config.async_runtime.build()?;
    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = Gateway::spawn(config).await?;
    info!(addr = %gateway.local_addr(), "central system up, connect charge points to ws://<addr>/ocpp/<identity>");

    let mut events = gateway.subscribe();
    let control = gateway.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                GatewayEvent::SessionReady { identity, .. } => {
                    // Ask every freshly booted charge point for its configuration.
                    let control = control.clone();
                    tokio::spawn(async move {
                        match control.call(&identity, "GetConfiguration", json!({})).await {
                            Ok(outcome) => info!(%identity, ?outcome, "GetConfiguration finished"),
                            Err(e) => warn!(%identity, error = %e, "GetConfiguration not sent"),
                        }
                    });
                }
                GatewayEvent::Disconnected { identity, reason, .. } => {
                    info!(%identity, ?reason, "charge point gone");
                }
                _ => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!(sessions = gateway.identities().len(), stats = ?gateway.forwarding_stats(), "shutting down");
    gateway.shutdown().await?;
    Ok(())
}
