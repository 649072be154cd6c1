use anyhow::Context;
use tapbridge::BridgeConfig;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid config: {err:#}");
            return Err(err).context("invalid configuration");
        }
    };

    tracing::info!(
        socket = %config.socket_path.display(),
        netns = ?config.netns,
        splice = config.tcp.splice,
        "tapbridge starting"
    );
    tapbridge::run(config)?;
    tracing::info!("tapbridge stopped");
    Ok(())
}
