use serde::{Serialize, Deserialize};
use chrono::NaiveDate;
use std::fmt;

use crate::config::WorkerDef;

/// Hours below this are treated as zero.
pub const EPSILON: f64 = 1e-9;

pub const MAX_PRIORITY: u8 = 5;

/// A production order in the active set. Built only through
/// `ingest::resolve`, so optional inputs are already defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  pub code: String,
  pub description: String,
  pub ordered_qty: u32,
  pub qty_to_deliver: u32,
  pub residual_value: f64,
  /// Hours per unit, always positive.
  pub cycle_time: f64,
  pub manual_priority: Option<u8>,
  pub doc_number: String,
  pub doc_date: NaiveDate,
  pub due_date: NaiveDate,
  /// Last computed score, 0..=5.
  pub priority: u8,
}

impl Order {
  pub fn remaining_hours(&self) -> f64 {
    self.qty_to_deliver as f64 * self.cycle_time
  }

  /// Delivered share of the ordered quantity, in percent.
  pub fn completion(&self) -> f64 {
    if self.ordered_qty == 0 {
      return 100.0;
    }
    let delivered = self.ordered_qty.saturating_sub(self.qty_to_deliver) as f64;
    (delivered / self.ordered_qty as f64 * 100.0).min(100.0)
  }

  pub fn is_done(&self) -> bool {
    self.qty_to_deliver == 0
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
  pub id: u32,
  pub name: String,
  pub daily_hours: f64,
  pub horizon_days: u32,
  pub committed_hours: f64,
}

impl Worker {
  pub fn from_def(def: &WorkerDef, horizon_days: u32) -> Self {
    Self {
      id: def.id,
      name: def.name.clone(),
      daily_hours: def.hours_per_day,
      horizon_days,
      committed_hours: 0.0,
    }
  }

  pub fn capacity_hours(&self) -> f64 {
    self.daily_hours * self.horizon_days as f64
  }

  pub fn available_hours(&self) -> f64 {
    (self.capacity_hours() - self.committed_hours).max(0.0)
  }

  /// Commits up to `hours`, bounded by what is still available, and
  /// returns the amount actually committed.
  pub fn commit(&mut self, hours: f64) -> f64 {
    if !hours.is_finite() || hours <= 0.0 {
      return 0.0;
    }
    let granted = hours.min(self.available_hours());
    self.committed_hours += granted;
    granted
  }

  pub fn release(&mut self, hours: f64) {
    if !hours.is_finite() || hours <= 0.0 {
      return;
    }
    self.committed_hours = (self.committed_hours - hours).max(0.0);
    if self.committed_hours < EPSILON {
      self.committed_hours = 0.0;
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
  Proposed,
  Awarded,
  InProgress,
  Completed,
  Cancelled,
}

impl AllocationState {
  pub fn is_active(self) -> bool {
    matches!(self, Self::Proposed | Self::Awarded | Self::InProgress)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Proposed => "proposed",
      Self::Awarded => "awarded",
      Self::InProgress => "in_progress",
      Self::Completed => "completed",
      Self::Cancelled => "cancelled",
    }
  }
}

impl fmt::Display for AllocationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Hours of one worker committed to one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
  pub order_code: String,
  pub worker_id: u32,
  pub hours: f64,
  pub worked_hours: f64,
  pub state: AllocationState,
  /// worked_hours / hours, 0.0..=1.0.
  pub progress: f64,
}

impl Allocation {
  pub fn proposed(order_code: impl Into<String>, worker_id: u32, hours: f64) -> Self {
    Self {
      order_code: order_code.into(),
      worker_id,
      hours,
      worked_hours: 0.0,
      state: AllocationState::Proposed,
      progress: 0.0,
    }
  }

  pub fn key(&self) -> (String, u32) {
    (self.order_code.clone(), self.worker_id)
  }

  pub fn outstanding_hours(&self) -> f64 {
    (self.hours - self.worked_hours).max(0.0)
  }

  /// Extends the allocation with a further award. Untouched allocations go
  /// back to `Proposed` until the award is confirmed; started ones stay
  /// `InProgress` and keep the progress already reported.
  pub fn extend(&mut self, hours: f64) {
    self.hours += hours;
    if self.worked_hours > EPSILON {
      let before = self.progress;
      self.refresh_progress();
      self.progress = self.progress.max(before);
      self.state = AllocationState::InProgress;
    } else {
      self.state = AllocationState::Proposed;
      self.refresh_progress();
    }
  }

  /// Marks a delivered award.
  pub fn confirm(&mut self) {
    if self.state == AllocationState::Proposed {
      self.state = AllocationState::Awarded;
    }
  }

  /// Records worked hours, capped at the allocated amount, and returns the
  /// hours actually booked.
  pub fn record_work(&mut self, hours: f64) -> f64 {
    if !self.state.is_active() || !hours.is_finite() || hours <= 0.0 {
      return 0.0;
    }
    let booked = hours.min(self.outstanding_hours());
    self.worked_hours += booked;
    let before = self.progress;
    self.refresh_progress();
    self.progress = self.progress.max(before);
    self.state = if self.progress >= 1.0 - EPSILON {
      AllocationState::Completed
    } else {
      AllocationState::InProgress
    };
    booked
  }

  /// Drops up to `hours` of outstanding work and returns what was dropped.
  pub fn trim(&mut self, hours: f64) -> f64 {
    let dropped = hours.max(0.0).min(self.outstanding_hours());
    self.hours -= dropped;
    if self.outstanding_hours() < EPSILON {
      self.hours = self.worked_hours;
      self.state = if self.worked_hours > EPSILON {
        AllocationState::Completed
      } else {
        AllocationState::Cancelled
      };
    }
    self.refresh_progress();
    dropped
  }

  fn refresh_progress(&mut self) {
    self.progress = if self.hours > EPSILON {
      (self.worked_hours / self.hours).clamp(0.0, 1.0)
    } else {
      0.0
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn worker(daily: f64, horizon: u32) -> Worker {
    Worker::from_def(&WorkerDef { id: 1, name: "W1".into(), hours_per_day: daily }, horizon)
  }

  #[test]
  fn worker_capacity_never_goes_negative() {
    let mut w = worker(2.0, 2);
    assert_eq!(w.capacity_hours(), 4.0);
    assert_eq!(w.commit(3.0), 3.0);
    assert_eq!(w.commit(3.0), 1.0);
    assert_eq!(w.available_hours(), 0.0);
    assert_eq!(w.commit(1.0), 0.0);
    w.release(10.0);
    assert_eq!(w.committed_hours, 0.0);
    assert_eq!(w.available_hours(), 4.0);
  }

  #[test]
  fn progress_is_monotonic_and_completes() {
    let mut a = Allocation::proposed("A", 1, 4.0);
    a.state = AllocationState::Awarded;
    assert_eq!(a.record_work(1.0), 1.0);
    assert_eq!(a.state, AllocationState::InProgress);
    assert_eq!(a.progress, 0.25);
    assert_eq!(a.record_work(0.0), 0.0);
    assert_eq!(a.progress, 0.25);
    assert_eq!(a.record_work(10.0), 3.0);
    assert_eq!(a.state, AllocationState::Completed);
    assert_eq!(a.progress, 1.0);
  }

  #[test]
  fn extending_a_started_allocation_keeps_it_in_progress() {
    let mut a = Allocation::proposed("A", 1, 4.0);
    a.confirm();
    assert_eq!(a.state, AllocationState::Awarded);
    a.record_work(1.0);
    assert_eq!(a.progress, 0.25);

    a.extend(1.0);
    a.confirm();
    assert_eq!(a.state, AllocationState::InProgress);
    assert_eq!(a.hours, 5.0);
    assert_eq!(a.progress, 0.25);

    a.record_work(1.0);
    assert_eq!(a.state, AllocationState::InProgress);
    assert_eq!(a.progress, 0.4);

    let mut fresh = Allocation::proposed("B", 1, 2.0);
    fresh.confirm();
    fresh.extend(2.0);
    assert_eq!(fresh.state, AllocationState::Proposed);
    fresh.confirm();
    assert_eq!(fresh.state, AllocationState::Awarded);
  }

  #[test]
  fn trimming_all_outstanding_work_closes_the_allocation() {
    let mut a = Allocation::proposed("A", 1, 4.0);
    a.state = AllocationState::Awarded;
    assert_eq!(a.trim(1.5), 1.5);
    assert_eq!(a.hours, 2.5);
    assert!(a.state.is_active());
    assert_eq!(a.trim(5.0), 2.5);
    assert_eq!(a.state, AllocationState::Cancelled);

    let mut b = Allocation::proposed("B", 1, 4.0);
    b.record_work(1.0);
    b.trim(3.0);
    assert_eq!(b.state, AllocationState::Completed);
    assert_eq!(b.progress, 1.0);
  }

  #[test]
  fn order_derived_fields() {
    let order = Order {
      code: "A".into(),
      description: String::new(),
      ordered_qty: 10,
      qty_to_deliver: 4,
      residual_value: 0.0,
      cycle_time: 1.5,
      manual_priority: None,
      doc_number: "1".into(),
      doc_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
      due_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
      priority: 0,
    };
    assert_eq!(order.remaining_hours(), 6.0);
    assert_eq!(order.completion(), 60.0);
    assert!(!order.is_done());
  }
}
