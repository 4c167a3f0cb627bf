//! Process entry point for the broker node.

use {
    anyhow::Context,
    clap::Parser,
    dgi_agents::DeviceTable,
    dgi_node::{Cli, NodeConfig, NodeService},
    log::info,
};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.level_filter())
        .format_timestamp_millis()
        .init();

    let cfg = NodeConfig::from_cli(&cli).context("invalid configuration")?;
    let devices = match &cli.devices {
        Some(path) => DeviceTable::load(path).context("invalid device table")?,
        None => DeviceTable::new(),
    };
    info!(
        "starting node {} with {} configured peers",
        cfg.me,
        cfg.peers.len()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build runtime")?;
    runtime.block_on(async move {
        let service = NodeService::new(cfg, devices).await?;
        service.run().await?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
