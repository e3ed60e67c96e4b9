use hotmod::{launch, HotmodConfig, Module, Unit};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = HotmodConfig::locate(std::env::args().nth(1));
    let config = HotmodConfig::load(&config_path)?;
    tracing::info!(
        "Loaded {} unit(s) from {}",
        config.unit.len(),
        config_path.display()
    );
    if config.unit.is_empty() {
        tracing::warn!("Nothing to supervise");
        return Ok(());
    }

    let mut units: Vec<Unit> = Vec::with_capacity(config.unit.len());
    for unit_config in config.unit {
        let unit = launch(unit_config)?;

        // report the first resolution of each unit
        let observed = unit.clone();
        tokio::spawn(async move {
            match observed.module().await {
                Ok(Module::Value(value)) => {
                    tracing::info!(module = %observed.name(), "Module value: {}", value)
                }
                Ok(Module::Function(_)) => {
                    tracing::info!(module = %observed.name(), "Module is a function")
                }
                Err(e) => tracing::warn!(
                    module = %observed.name(),
                    code = e.error_code(),
                    "Module did not load: {}",
                    e
                ),
            }
        });

        units.push(unit);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, killing {} unit(s)...", units.len());

    let mut kills = tokio::task::JoinSet::new();
    for unit in units {
        kills.spawn(async move { unit.kill().await });
    }
    while kills.join_next().await.is_some() {}

    tracing::info!("All units killed, exiting");
    Ok(())
}
