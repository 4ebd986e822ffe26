use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use shopfloor::{
  config::Config,
  database::setup_database,
  feed::{amqp::spawn_amqp_feed, file::FileFeed},
  messaging::create_rabbit_channel,
  persistence::{spawn_sink, PgSnapshotSink},
  planner::{spawn_agents, system_today},
  routes::routes,
};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  info!(workers = config.workers.len(), horizon_days = config.horizon_days, "starting planner");

  let agents = spawn_agents(&config, system_today());
  let planner = agents.planner.clone();

  if let Some(database_url) = &config.database_url {
    match setup_database(database_url).await {
      Ok(pool) => {
        spawn_sink(PgSnapshotSink::new(pool), planner.subscribe());
      }
      Err(e) => warn!("Persistence disabled, database unavailable: {:?}", e),
    }
  }

  if let Some(rabbitmq_url) = &config.rabbitmq_url {
    let channel = create_rabbit_channel(rabbitmq_url).await?;
    spawn_amqp_feed(channel, planner.clone()).await?;
  }

  if let Some(path) = &config.order_file {
    info!(path = %path.display(), every = ?config.order_poll, "polling order file");
    FileFeed::new(path, config.default_cycle_time).spawn(planner.clone(), config.order_poll);
  }

  let api = routes(planner.clone(), agents.workers.clone());
  let (addr, server) = warp::serve(api).bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      error!("Failed to listen for shutdown signal: {:?}", e);
    }
  });
  info!(%addr, "HTTP API listening");
  server.await;

  info!("shutting down");
  planner.shutdown().await?;
  Ok(())
}
