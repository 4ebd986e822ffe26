//! Read-only view of the schedule, published by the planner each time a
//! cycle settles. Consumers hold `Arc<ScheduleSnapshot>` values and never
//! see planner state mid-cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::events::Stamp;
use crate::models::{Allocation, Order, Worker};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderStatus {
  #[serde(flatten)]
  pub order: Order,
  pub remaining_hours: f64,
  /// Outstanding hours held by active allocations.
  pub allocated_hours: f64,
  pub unallocated_hours: f64,
  /// Delivered share of the ordered quantity, in percent.
  pub completion: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerLoad {
  pub id: u32,
  pub name: String,
  pub daily_hours: f64,
  pub capacity_hours: f64,
  pub committed_hours: f64,
  pub available_hours: f64,
  /// Committed share of capacity, in percent.
  pub load: f64,
}

impl From<&Worker> for WorkerLoad {
  fn from(worker: &Worker) -> Self {
    let capacity = worker.capacity_hours();
    Self {
      id: worker.id,
      name: worker.name.clone(),
      daily_hours: worker.daily_hours,
      capacity_hours: capacity,
      committed_hours: worker.committed_hours,
      available_hours: worker.available_hours(),
      load: if capacity > 0.0 { worker.committed_hours / capacity * 100.0 } else { 0.0 },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
  pub code: String,
  pub reason: String,
  pub stamp: Stamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleSnapshot {
  pub id: Uuid,
  /// Number of the cycle that produced this snapshot, 0 before the first.
  pub cycle: u64,
  pub settled_at: Option<DateTime<Utc>>,
  pub stamp: Stamp,
  /// Active orders in worklist order.
  pub orders: Vec<OrderStatus>,
  /// Active allocations ordered by (order code, worker id).
  pub allocations: Vec<Allocation>,
  /// Most recently completed or cancelled allocations, newest first.
  pub recent: Vec<Allocation>,
  pub workers: Vec<WorkerLoad>,
  pub rejected: Vec<Rejection>,
}

impl ScheduleSnapshot {
  pub fn empty(workers: &[Worker]) -> Self {
    Self {
      id: Uuid::new_v4(),
      cycle: 0,
      settled_at: None,
      stamp: Stamp::default(),
      orders: Vec::new(),
      allocations: Vec::new(),
      recent: Vec::new(),
      workers: workers.iter().map(WorkerLoad::from).collect(),
      rejected: Vec::new(),
    }
  }

  pub fn order(&self, code: &str) -> Option<&OrderStatus> {
    self.orders.iter().find(|o| o.order.code == code)
  }

  pub fn allocations_for(&self, code: &str) -> impl Iterator<Item = &Allocation> {
    self.allocations.iter().filter(move |a| a.order_code == code)
  }

  pub fn worker(&self, id: u32) -> Option<&WorkerLoad> {
    self.workers.iter().find(|w| w.id == id)
  }

  /// Allocation table without the per-snapshot identity, for comparing
  /// outcomes of different cycles.
  pub fn table(&self) -> Vec<(String, u32, f64, f64)> {
    self
      .allocations
      .iter()
      .map(|a| (a.order_code.clone(), a.worker_id, a.hours, a.worked_hours))
      .collect()
  }
}
