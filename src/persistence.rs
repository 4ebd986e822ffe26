//! Best-effort export of settled snapshots. The planner never waits on it;
//! a failed write is retried a few times and then logged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::{Pool, Postgres};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info};

use crate::snapshot::ScheduleSnapshot;

static MAX_RETRIES: usize = 3;
static MAX_DELAY: Duration = Duration::from_secs(2);

/// 100 ms, 200 ms, 400 ms, never more than `MAX_DELAY`.
fn retry_delays() -> impl Iterator<Item = Duration> {
  ExponentialBackoff::from_millis(2).factor(50).max_delay(MAX_DELAY).take(MAX_RETRIES)
}

pub trait SnapshotSink {
  fn write(&self, snapshot: &ScheduleSnapshot) -> impl Future<Output = Result<()>> + Send;
}

/// Replaces the schedule tables with each snapshot inside one transaction
/// and appends a `schedule_runs` row.
#[derive(Debug, Clone)]
pub struct PgSnapshotSink {
  pool: Pool<Postgres>,
}

impl PgSnapshotSink {
  pub fn new(pool: Pool<Postgres>) -> Self {
    Self { pool }
  }
}

impl SnapshotSink for PgSnapshotSink {
  async fn write(&self, snapshot: &ScheduleSnapshot) -> Result<()> {
    let mut tx = self.pool.begin().await?;

    sqlx::query("DELETE FROM allocations").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM orders").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM workers").execute(&mut *tx).await?;

    for (rank, status) in snapshot.orders.iter().enumerate() {
      let order = &status.order;
      sqlx::query(
        "INSERT INTO orders (code, rank, description, ordered_qty, qty_to_deliver, cycle_time, due_date, priority,
                             remaining_hours, allocated_hours, unallocated_hours, completion)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
      )
        .bind(&order.code)
        .bind(rank as i32)
        .bind(&order.description)
        .bind(i64::from(order.ordered_qty))
        .bind(i64::from(order.qty_to_deliver))
        .bind(order.cycle_time)
        .bind(order.due_date)
        .bind(order.priority as i16)
        .bind(status.remaining_hours)
        .bind(status.allocated_hours)
        .bind(status.unallocated_hours)
        .bind(status.completion)
        .execute(&mut *tx)
        .await?;
    }

    for allocation in &snapshot.allocations {
      sqlx::query(
        "INSERT INTO allocations (order_code, worker_id, hours, worked_hours, state, progress)
         VALUES ($1, $2, $3, $4, $5, $6)",
      )
        .bind(&allocation.order_code)
        .bind(allocation.worker_id as i32)
        .bind(allocation.hours)
        .bind(allocation.worked_hours)
        .bind(allocation.state.as_str())
        .bind(allocation.progress)
        .execute(&mut *tx)
        .await?;
    }

    for worker in &snapshot.workers {
      sqlx::query(
        "INSERT INTO workers (id, name, daily_hours, capacity_hours, committed_hours, available_hours)
         VALUES ($1, $2, $3, $4, $5, $6)",
      )
        .bind(worker.id as i32)
        .bind(&worker.name)
        .bind(worker.daily_hours)
        .bind(worker.capacity_hours)
        .bind(worker.committed_hours)
        .bind(worker.available_hours)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
      "INSERT INTO schedule_runs (id, cycle, stamp, settled_at, order_count, allocation_count, rejected_count)
       VALUES ($1, $2, $3, COALESCE($4, NOW()), $5, $6, $7)",
    )
      .bind(snapshot.id)
      .bind(snapshot.cycle as i64)
      .bind(snapshot.stamp.0 as i64)
      .bind(snapshot.settled_at)
      .bind(snapshot.orders.len() as i32)
      .bind(snapshot.allocations.len() as i32)
      .bind(snapshot.rejected.len() as i32)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;
    Ok(())
  }
}

/// Writes every settled snapshot to `sink` until the planner goes away.
/// Snapshots that settle while a write is running collapse into the newest.
pub fn spawn_sink<S>(sink: S, mut snapshots: watch::Receiver<Arc<ScheduleSnapshot>>) -> JoinHandle<()>
where
  S: SnapshotSink + Send + Sync + 'static,
{
  tokio::spawn(async move {
    while snapshots.changed().await.is_ok() {
      let snapshot = snapshots.borrow_and_update().clone();
      if snapshot.settled_at.is_none() {
        continue;
      }
      let (sink, settled) = (&sink, snapshot.as_ref());
      let written = Retry::spawn(retry_delays(), move || sink.write(settled))
        .await;
      match written {
        Ok(()) => debug!(cycle = snapshot.cycle, "snapshot persisted"),
        Err(e) => error!(cycle = snapshot.cycle, error = %e, "failed to persist snapshot"),
      }
    }
    info!("snapshot sink stopped");
  })
}
