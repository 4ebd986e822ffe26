use std::time::Duration;

use anyhow::Result;
use sqlx::{Pool, Postgres};
use sqlx::migrate::Migrator;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>> {
  let pool = Retry::spawn(ExponentialBackoff::from_millis(2).factor(50).max_delay(Duration::from_secs(5)).take(5), || {
    Pool::<Postgres>::connect(database_url)
  })
    .await?;

  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}
