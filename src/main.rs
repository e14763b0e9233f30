use anyhow::Context;
use tollgate::{App, ConfigBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .from_env()
        .build()
        .context("invalid configuration")?;

    tollgate::init_tracing_with_config(&config);

    let app = App::from_config(config)
        .await
        .context("failed to initialise billing services")?;

    app.serve().await.context("server error")?;
    Ok(())
}
