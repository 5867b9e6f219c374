use anyhow::Result;
use clap::Parser;
use courier_cli::config::CliConfig;
use courier_cli::run;
use courier_store::create_store;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = CliConfig::parse();
    info!("courier starting");

    let store_config = config.store_config();
    let objects = create_store(&store_config)?;
    info!("object store: {}", objects.name());

    let report = run::run(&config, objects).await?;
    for (file, reason) in &report.rejected {
        error!("{file}: {reason}");
    }
    if !report.success() {
        error!("composition {} was not delivered cleanly", report.composition_id);
        std::process::exit(1);
    }
    info!(
        "composition {} delivered ({} files)",
        report.composition_id,
        report.uploads.succeeded.len()
    );
    Ok(())
}
