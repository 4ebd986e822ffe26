//! Messages exchanged between the order feed, the planner and the worker
//! agents. Every event carries a Lamport stamp from the agent that emitted
//! it; receivers fold incoming stamps into their own clock.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ingest::{OrderPatch, OrderRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp(pub u64);

/// Per-agent logical clock. Never shared between agents.
#[derive(Debug, Default)]
pub struct LamportClock {
  last: u64,
}

impl LamportClock {
  pub fn tick(&mut self) -> Stamp {
    self.last += 1;
    Stamp(self.last)
  }

  pub fn observe(&mut self, seen: Stamp) -> Stamp {
    self.last = self.last.max(seen.0) + 1;
    Stamp(self.last)
  }

  pub fn now(&self) -> Stamp {
    Stamp(self.last)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRequest {
  pub stamp: Stamp,
  pub cycle: u64,
  pub order_code: String,
  pub hours: f64,
  pub due_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidResponse {
  pub stamp: Stamp,
  pub cycle: u64,
  pub order_code: String,
  pub worker_id: u32,
  pub hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationAward {
  pub stamp: Stamp,
  pub cycle: u64,
  pub order_code: String,
  pub worker_id: u32,
  pub hours: f64,
  /// Hours per unit, so the worker can turn produced units into hours.
  pub cycle_time: f64,
}

/// Planner takes back outstanding hours from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRevoked {
  pub stamp: Stamp,
  pub order_code: String,
  pub worker_id: u32,
  pub hours: f64,
}

/// The order behind an allocation is finished or withdrawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationClosed {
  pub stamp: Stamp,
  pub order_code: String,
  pub worker_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
  pub stamp: Stamp,
  pub order_code: String,
  pub worker_id: u32,
  /// Units produced since the previous report.
  pub units: u32,
  /// Worker-side progress of its allocation after this report.
  pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
  #[serde(default)]
  pub stamp: Stamp,
  pub record: OrderRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdated {
  #[serde(default)]
  pub stamp: Stamp,
  pub code: String,
  pub patch: OrderPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRemoved {
  #[serde(default)]
  pub stamp: Stamp,
  pub code: String,
}

/// Ingestion events as produced by the order feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
  OrderCreated(OrderCreated),
  OrderUpdated(OrderUpdated),
  OrderRemoved(OrderRemoved),
}

impl FeedEvent {
  pub fn code(&self) -> &str {
    match self {
      FeedEvent::OrderCreated(e) => e.record.code.as_deref().unwrap_or(""),
      FeedEvent::OrderUpdated(e) => &e.code,
      FeedEvent::OrderRemoved(e) => &e.code,
    }
  }

  pub fn stamp(&self) -> Stamp {
    match self {
      FeedEvent::OrderCreated(e) => e.stamp,
      FeedEvent::OrderUpdated(e) => e.stamp,
      FeedEvent::OrderRemoved(e) => e.stamp,
    }
  }
}
