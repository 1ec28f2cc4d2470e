//! Applies the ledger schema to the database named by `DATABASE_URL`.

use anyhow::Context;

use dispensary_infra::{LedgerConfig, PostgresLedgerStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dispensary_observability::init();

    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;
    if config.database_url.is_none() {
        anyhow::bail!("DATABASE_URL must be set to run migrations");
    }

    let store = PostgresLedgerStore::connect(&config)
        .await
        .context("failed to connect to Postgres")?;
    store.migrate().await.context("failed to apply ledger schema")?;

    tracing::info!("ledger schema is up to date");
    Ok(())
}
