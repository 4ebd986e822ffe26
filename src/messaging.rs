use std::time::Duration;

use lapin::{
  options::QueueDeclareOptions,
  types::FieldTable,
  Channel, Connection, ConnectionProperties,
};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;
use anyhow::Result;

/// Queue carrying JSON `FeedEvent` bodies into the planner.
pub const FEED_QUEUE: &str = "order_feed";

static MAX_RETRIES: usize = 5;
static MAX_DELAY: Duration = Duration::from_secs(5);

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(2).factor(50).max_delay(MAX_DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn declare_feed_queue(channel: &Channel) -> Result<()> {
  channel
    .queue_declare(FEED_QUEUE, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
    .await?;
  Ok(())
}

/// Messages waiting in the feed queue. Passive declare, so the queue is
/// never created from here.
pub async fn feed_backlog(channel: &Channel) -> Result<u32> {
  let queue = channel
    .queue_declare(
      FEED_QUEUE,
      QueueDeclareOptions { passive: true, ..Default::default() },
      FieldTable::default(),
    )
    .await?;
  Ok(queue.message_count())
}
