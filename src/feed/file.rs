//! Polls a JSON order table (an array of order rows) and turns the
//! differences against the previous poll into feed events.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{FeedEvent, LamportClock, OrderCreated, OrderRemoved, OrderUpdated};
use crate::ingest::{self, OrderPatch, OrderRecord};
use crate::planner::PlannerHandle;

pub struct FileFeed {
  path: PathBuf,
  default_cycle_time: f64,
  /// Rows of the previous successful poll, by code.
  known: BTreeMap<String, OrderRecord>,
  clock: LamportClock,
}

impl FileFeed {
  pub fn new(path: impl Into<PathBuf>, default_cycle_time: f64) -> Self {
    Self {
      path: path.into(),
      default_cycle_time,
      known: BTreeMap::new(),
      clock: LamportClock::default(),
    }
  }

  pub async fn read_rows(&self) -> Result<Vec<OrderRecord>> {
    let raw = tokio::fs::read(&self.path)
      .await
      .with_context(|| format!("reading order file {}", self.path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing order file {}", self.path.display()))
  }

  /// Events that turn the previous poll into `rows`. Rows whose code was
  /// already seen in the same poll are dropped.
  pub fn diff(&mut self, rows: Vec<OrderRecord>) -> Vec<FeedEvent> {
    let mut events = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = BTreeMap::new();

    for row in rows {
      let code = row.code.as_deref().map(str::trim).unwrap_or_default().to_string();
      if code.is_empty() {
        events.push(self.created(row));
        continue;
      }
      if !seen.insert(code.clone()) {
        warn!(order = %code, path = %self.path.display(), "duplicate order code in feed, row ignored");
        continue;
      }

      match self.known.get(&code).cloned() {
        None => events.push(self.created(row.clone())),
        Some(previous) => {
          if let Some(event) = self.changed(&code, &previous, &row) {
            events.push(event);
          }
        }
      }
      current.insert(code, row);
    }

    let gone: Vec<String> = self.known.keys().filter(|code| !current.contains_key(*code)).cloned().collect();
    for code in gone {
      events.push(FeedEvent::OrderRemoved(OrderRemoved { stamp: self.clock.tick(), code }));
    }

    self.known = current;
    events
  }

  fn created(&mut self, record: OrderRecord) -> FeedEvent {
    FeedEvent::OrderCreated(OrderCreated { stamp: self.clock.tick(), record })
  }

  fn changed(&mut self, code: &str, previous: &OrderRecord, row: &OrderRecord) -> Option<FeedEvent> {
    if previous == row {
      return None;
    }
    // A patch cannot express a field that went missing, so anything that
    // was or became invalid is resent whole and re-validated.
    let both_valid = ingest::resolve(previous, self.default_cycle_time).is_ok()
      && ingest::resolve(row, self.default_cycle_time).is_ok();
    match OrderPatch::between(previous, row) {
      Some(patch) if both_valid => {
        Some(FeedEvent::OrderUpdated(OrderUpdated { stamp: self.clock.tick(), code: code.to_string(), patch }))
      }
      _ => Some(self.created(row.clone())),
    }
  }

  /// Reads the file once and forwards the resulting events. A file that
  /// cannot be read or parsed leaves the known rows untouched.
  pub async fn poll(&mut self, planner: &PlannerHandle) -> Result<usize> {
    let rows = self.read_rows().await?;
    let events = self.diff(rows);
    let count = events.len();
    for event in events {
      planner.feed(event).await?;
    }
    if count > 0 {
      info!(path = %self.path.display(), events = count, "order file changes forwarded");
    } else {
      debug!(path = %self.path.display(), "order file unchanged");
    }
    Ok(count)
  }

  pub fn spawn(mut self, planner: PlannerHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      loop {
        ticker.tick().await;
        if let Err(e) = self.poll(&planner).await {
          if planner.sender().is_closed() {
            info!("planner gone, order file feed stopped");
            return;
          }
          error!(path = %self.path.display(), error = %e, "order file poll failed");
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn row(code: &str, qty: i64) -> OrderRecord {
    OrderRecord {
      code: Some(code.into()),
      description: Some("Shaft".into()),
      ordered_qty: Some(qty),
      qty_to_deliver: Some(qty),
      residual_value: Some(10.0),
      cycle_time: Some(0.5),
      manual_priority: None,
      doc_number: Some("D-1".into()),
      doc_date: Some("2024-01-02".into()),
      due_date: Some("2024-02-01".into()),
    }
  }

  fn kinds(events: &[FeedEvent]) -> Vec<(&'static str, String)> {
    events
      .iter()
      .map(|e| {
        let kind = match e {
          FeedEvent::OrderCreated(_) => "created",
          FeedEvent::OrderUpdated(_) => "updated",
          FeedEvent::OrderRemoved(_) => "removed",
        };
        (kind, e.code().to_string())
      })
      .collect()
  }

  #[test]
  fn first_poll_creates_every_row() {
    let mut feed = FileFeed::new("orders.json", 1.0);
    let events = feed.diff(vec![row("A", 4), row("B", 2)]);
    assert_eq!(kinds(&events), vec![("created", "A".into()), ("created", "B".into())]);
  }

  #[test]
  fn later_polls_send_patches_and_removals() {
    let mut feed = FileFeed::new("orders.json", 1.0);
    feed.diff(vec![row("A", 4), row("B", 2)]);

    let mut a = row("A", 4);
    a.qty_to_deliver = Some(1);
    let events = feed.diff(vec![a.clone(), row("C", 3)]);
    assert_eq!(
      kinds(&events),
      vec![("updated", "A".into()), ("created", "C".into()), ("removed", "B".into())]
    );
    match &events[0] {
      FeedEvent::OrderUpdated(u) => assert_eq!(u.patch.qty_to_deliver, Some(1)),
      other => panic!("unexpected event {:?}", other),
    }

    assert!(feed.diff(vec![row("C", 3), a]).is_empty());
  }

  #[test]
  fn duplicate_codes_keep_the_first_row() {
    let mut feed = FileFeed::new("orders.json", 1.0);
    let events = feed.diff(vec![row("A", 4), row("A", 9)]);
    assert_eq!(events.len(), 1);
    match &events[0] {
      FeedEvent::OrderCreated(c) => assert_eq!(c.record.ordered_qty, Some(4)),
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[test]
  fn a_row_that_breaks_is_resent_whole() {
    let mut feed = FileFeed::new("orders.json", 1.0);
    feed.diff(vec![row("A", 4)]);
    let mut broken = row("A", 4);
    broken.description = None;
    let events = feed.diff(vec![broken.clone()]);
    match &events[..] {
      [FeedEvent::OrderCreated(c)] => assert_eq!(c.record, broken),
      other => panic!("unexpected events {:?}", other),
    }
  }

  #[test]
  fn stamps_increase_within_a_feed() {
    let mut feed = FileFeed::new("orders.json", 1.0);
    let events = feed.diff(vec![row("A", 1), row("B", 1), row("C", 1)]);
    let stamps: Vec<_> = events.iter().map(FeedEvent::stamp).collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
  }

  #[tokio::test]
  async fn unreadable_file_is_an_error() {
    let path = std::env::temp_dir().join(format!("shopfloor-{}.json", uuid::Uuid::new_v4()));
    let feed = FileFeed::new(&path, 1.0);
    assert!(feed.read_rows().await.is_err());

    tokio::fs::write(&path, b"{not json").await.unwrap();
    assert!(feed.read_rows().await.is_err());

    tokio::fs::write(&path, serde_json::to_vec(&vec![row("A", 2)]).unwrap()).await.unwrap();
    assert_eq!(feed.read_rows().await.unwrap(), vec![row("A", 2)]);
    tokio::fs::remove_file(&path).await.unwrap();
  }
}
