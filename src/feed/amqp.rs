use futures_lite::StreamExt;
use lapin::{
  options::{BasicAckOptions, BasicConsumeOptions},
  types::FieldTable,
  Channel,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::FeedEvent;
use crate::messaging::{declare_feed_queue, FEED_QUEUE};
use crate::planner::PlannerHandle;

pub fn decode(body: &[u8]) -> Result<FeedEvent, serde_json::Error> {
  serde_json::from_slice(body)
}

/// Consumes the feed queue and forwards every event to the planner.
/// Bodies that do not parse are acked and dropped so they are not
/// redelivered forever.
pub async fn spawn_amqp_feed(channel: Channel, planner: PlannerHandle) -> anyhow::Result<JoinHandle<()>> {
  declare_feed_queue(&channel).await?;
  let mut consumer = channel
    .basic_consume(FEED_QUEUE, "shopfloor_planner", BasicConsumeOptions::default(), FieldTable::default())
    .await?;
  info!(queue = FEED_QUEUE, "order feed consumer started");

  Ok(tokio::spawn(async move {
    while let Some(delivery) = consumer.next().await {
      let delivery = match delivery {
        Ok(delivery) => delivery,
        Err(e) => {
          error!("Consumer error: {:?}", e);
          continue;
        }
      };

      match decode(&delivery.data) {
        Ok(event) => {
          if planner.feed(event).await.is_err() {
            warn!("planner gone, order feed consumer stopped");
            return;
          }
        }
        Err(e) => warn!(error = %e, bytes = delivery.data.len(), "malformed feed message dropped"),
      }
      if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!("Failed to ack feed message: {:?}", e);
      }
    }
    info!("order feed consumer closed");
  }))
}
