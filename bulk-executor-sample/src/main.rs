use anyhow::Context;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;

use bulk_executor_sample::config::Config;
use bulk_executor_sample::run::run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling import");
            interrupt.cancel();
        }
    });

    let report = run(config, cancel).await?;
    println!("{}", report.summary);

    Ok(())
}
