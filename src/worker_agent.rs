use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProgressError;
use crate::events::{
  AllocationAward, AllocationClosed, AllocationRevoked, BidRequest, BidResponse, LamportClock, ProgressUpdate,
};
use crate::models::{Worker, EPSILON};
use crate::planner::PlannerEvent;

#[derive(Debug)]
pub enum WorkerMessage {
  Bid { request: BidRequest, reply: oneshot::Sender<BidResponse> },
  Award(AllocationAward),
  Revoke(AllocationRevoked),
  Close(AllocationClosed),
  /// Units produced on the shop floor for an order.
  Progress { order_code: String, units: u32, reply: oneshot::Sender<ProgressUpdate> },
  Status { reply: oneshot::Sender<WorkerStatus> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalAllocation {
  pub order_code: String,
  pub hours: f64,
  pub worked_hours: f64,
  pub cycle_time: f64,
}

impl LocalAllocation {
  fn outstanding(&self) -> f64 {
    (self.hours - self.worked_hours).max(0.0)
  }

  fn progress(&self) -> f64 {
    if self.hours > EPSILON { (self.worked_hours / self.hours).clamp(0.0, 1.0) } else { 0.0 }
  }
}

/// The worker's own view of its ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
  pub id: u32,
  pub name: String,
  pub capacity_hours: f64,
  pub committed_hours: f64,
  pub available_hours: f64,
  pub allocations: Vec<LocalAllocation>,
}

/// Sending side of a worker agent's inbox.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
  pub id: u32,
  tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
  pub fn new(id: u32, tx: mpsc::Sender<WorkerMessage>) -> Self {
    Self { id, tx }
  }

  pub async fn send(&self, message: WorkerMessage) -> Result<(), mpsc::error::SendError<WorkerMessage>> {
    self.tx.send(message).await
  }

  /// Feeds produced units into the worker. The worker forwards a
  /// `ProgressUpdate` to the planner and hands a copy back.
  pub async fn report_progress(&self, order_code: &str, units: u32) -> Result<ProgressUpdate, ProgressError> {
    if units == 0 {
      return Err(ProgressError::NoUnits);
    }
    let (reply, rx) = oneshot::channel();
    self
      .send(WorkerMessage::Progress { order_code: order_code.to_string(), units, reply })
      .await
      .map_err(|_| ProgressError::WorkerGone(self.id))?;
    rx.await.map_err(|_| ProgressError::WorkerGone(self.id))
  }

  pub async fn status(&self) -> Option<WorkerStatus> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerMessage::Status { reply }).await.ok()?;
    rx.await.ok()
  }
}

/// One worker resource. Owns its capacity ledger and processes its inbox
/// strictly in order, so an award always lands before the next bid.
pub struct WorkerAgent {
  worker: Worker,
  allocations: BTreeMap<String, LocalAllocation>,
  clock: LamportClock,
  inbox: mpsc::Receiver<WorkerMessage>,
  planner: mpsc::Sender<PlannerEvent>,
}

impl WorkerAgent {
  pub fn spawn(worker: Worker, planner: mpsc::Sender<PlannerEvent>, capacity: usize) -> (WorkerHandle, JoinHandle<()>) {
    let (tx, inbox) = mpsc::channel(capacity);
    let handle = WorkerHandle::new(worker.id, tx);
    let agent = Self {
      worker,
      allocations: BTreeMap::new(),
      clock: LamportClock::default(),
      inbox,
      planner,
    };
    (handle, tokio::spawn(agent.run()))
  }

  async fn run(mut self) {
    info!(worker = self.worker.id, capacity = self.worker.capacity_hours(), "worker agent started");
    while let Some(message) = self.inbox.recv().await {
      match message {
        WorkerMessage::Bid { request, reply } => {
          let response = self.bid(&request);
          if reply.send(response).is_err() {
            debug!(worker = self.worker.id, order = %request.order_code, "bid window closed before reply");
          }
        }
        WorkerMessage::Award(award) => self.commit(&award),
        WorkerMessage::Revoke(revoked) => self.revoke(&revoked),
        WorkerMessage::Close(closed) => self.close(&closed),
        WorkerMessage::Progress { order_code, units, reply } => {
          let update = self.progress(&order_code, units);
          if self.planner.send(PlannerEvent::Progress(update.clone())).await.is_err() {
            warn!(worker = self.worker.id, "planner inbox closed, progress not delivered");
          }
          let _ = reply.send(update);
        }
        WorkerMessage::Status { reply } => {
          let _ = reply.send(self.status());
        }
      }
    }
    info!(worker = self.worker.id, "worker agent stopped");
  }

  fn bid(&mut self, request: &BidRequest) -> BidResponse {
    self.clock.observe(request.stamp);
    let available = self.worker.available_hours();
    let hours = if !request.hours.is_finite() || request.hours < 0.0 {
      warn!(worker = self.worker.id, order = %request.order_code, hours = request.hours, "malformed bid request");
      0.0
    } else if !available.is_finite() {
      error!(worker = self.worker.id, committed = self.worker.committed_hours, "capacity ledger corrupt, bidding zero");
      0.0
    } else {
      available.min(request.hours)
    };
    debug!(worker = self.worker.id, order = %request.order_code, cycle = request.cycle, hours, "bid");
    BidResponse {
      stamp: self.clock.tick(),
      cycle: request.cycle,
      order_code: request.order_code.clone(),
      worker_id: self.worker.id,
      hours,
    }
  }

  fn commit(&mut self, award: &AllocationAward) {
    self.clock.observe(award.stamp);
    let granted = self.worker.commit(award.hours);
    if granted + EPSILON < award.hours {
      warn!(
        worker = self.worker.id,
        order = %award.order_code,
        awarded = award.hours,
        granted,
        "award exceeds available capacity, clamped"
      );
    }
    let local = self
      .allocations
      .entry(award.order_code.clone())
      .or_insert_with(|| LocalAllocation {
        order_code: award.order_code.clone(),
        hours: 0.0,
        worked_hours: 0.0,
        cycle_time: award.cycle_time,
      });
    local.hours += granted;
    local.cycle_time = award.cycle_time;
    info!(worker = self.worker.id, order = %award.order_code, hours = granted, "allocation committed");
  }

  fn revoke(&mut self, revoked: &AllocationRevoked) {
    self.clock.observe(revoked.stamp);
    let Some(local) = self.allocations.get_mut(&revoked.order_code) else {
      debug!(worker = self.worker.id, order = %revoked.order_code, "revoke for unknown allocation");
      return;
    };
    let released = revoked.hours.max(0.0).min(local.outstanding());
    local.hours -= released;
    self.worker.release(released);
    if local.outstanding() < EPSILON {
      self.allocations.remove(&revoked.order_code);
    }
    info!(worker = self.worker.id, order = %revoked.order_code, hours = released, "allocation revoked");
  }

  fn close(&mut self, closed: &AllocationClosed) {
    self.clock.observe(closed.stamp);
    if let Some(local) = self.allocations.remove(&closed.order_code) {
      self.worker.release(local.outstanding());
      info!(worker = self.worker.id, order = %closed.order_code, "allocation closed");
    }
  }

  fn progress(&mut self, order_code: &str, units: u32) -> ProgressUpdate {
    let progress = match self.allocations.get_mut(order_code) {
      Some(local) => {
        let booked = (units as f64 * local.cycle_time).min(local.outstanding());
        local.worked_hours += booked;
        let progress = local.progress();
        self.worker.release(booked);
        progress
      }
      None => {
        debug!(worker = self.worker.id, order = order_code, "progress without a local allocation");
        0.0
      }
    };
    ProgressUpdate {
      stamp: self.clock.tick(),
      order_code: order_code.to_string(),
      worker_id: self.worker.id,
      units,
      progress,
    }
  }

  fn status(&self) -> WorkerStatus {
    WorkerStatus {
      id: self.worker.id,
      name: self.worker.name.clone(),
      capacity_hours: self.worker.capacity_hours(),
      committed_hours: self.worker.committed_hours,
      available_hours: self.worker.available_hours(),
      allocations: self.allocations.values().cloned().collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::WorkerDef;
  use crate::events::Stamp;
  use chrono::NaiveDate;

  fn spawn_worker(hours: f64) -> (WorkerHandle, mpsc::Receiver<PlannerEvent>) {
    let (planner_tx, planner_rx) = mpsc::channel(8);
    let worker = Worker::from_def(&WorkerDef { id: 7, name: "W7".into(), hours_per_day: hours }, 1);
    let (handle, _task) = WorkerAgent::spawn(worker, planner_tx, 8);
    (handle, planner_rx)
  }

  async fn bid(handle: &WorkerHandle, hours: f64) -> BidResponse {
    let (reply, rx) = oneshot::channel();
    let request = BidRequest {
      stamp: Stamp(1),
      cycle: 1,
      order_code: "A".into(),
      hours,
      due_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    };
    handle.send(WorkerMessage::Bid { request, reply }).await.unwrap();
    rx.await.unwrap()
  }

  fn award(hours: f64) -> WorkerMessage {
    WorkerMessage::Award(AllocationAward {
      stamp: Stamp(2),
      cycle: 1,
      order_code: "A".into(),
      worker_id: 7,
      hours,
      cycle_time: 0.5,
    })
  }

  #[tokio::test]
  async fn bid_is_bounded_by_available_capacity() {
    let (handle, _planner) = spawn_worker(5.0);
    assert_eq!(bid(&handle, 3.0).await.hours, 3.0);
    assert_eq!(bid(&handle, 9.0).await.hours, 5.0);
    assert_eq!(bid(&handle, -1.0).await.hours, 0.0);
    assert_eq!(bid(&handle, f64::NAN).await.hours, 0.0);
  }

  #[tokio::test]
  async fn award_is_committed_before_the_next_bid() {
    let (handle, _planner) = spawn_worker(5.0);
    handle.send(award(2.0)).await.unwrap();
    assert_eq!(bid(&handle, 10.0).await.hours, 3.0);

    handle.send(award(7.0)).await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.committed_hours, 5.0);
    assert_eq!(status.available_hours, 0.0);
    assert_eq!(status.allocations[0].hours, 5.0);
  }

  #[tokio::test]
  async fn progress_is_forwarded_and_frees_capacity() {
    let (handle, mut planner) = spawn_worker(5.0);
    handle.send(award(4.0)).await.unwrap();

    let update = handle.report_progress("A", 2).await.unwrap();
    assert_eq!(update.units, 2);
    assert_eq!(update.progress, 0.25);

    match planner.recv().await {
      Some(PlannerEvent::Progress(forwarded)) => assert_eq!(forwarded, update),
      other => panic!("unexpected planner event: {:?}", other),
    }
    let status = handle.status().await.unwrap();
    assert_eq!(status.committed_hours, 3.0);
  }

  #[tokio::test]
  async fn revoke_and_close_release_hours() {
    let (handle, _planner) = spawn_worker(5.0);
    handle.send(award(4.0)).await.unwrap();
    handle
      .send(WorkerMessage::Revoke(AllocationRevoked {
        stamp: Stamp(3),
        order_code: "A".into(),
        worker_id: 7,
        hours: 1.5,
      }))
      .await
      .unwrap();
    assert_eq!(handle.status().await.unwrap().committed_hours, 2.5);

    handle
      .send(WorkerMessage::Close(AllocationClosed { stamp: Stamp(4), order_code: "A".into(), worker_id: 7 }))
      .await
      .unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.committed_hours, 0.0);
    assert!(status.allocations.is_empty());
  }

  #[tokio::test]
  async fn zero_units_are_refused_locally() {
    let (handle, _planner) = spawn_worker(5.0);
    assert!(matches!(handle.report_progress("A", 0).await, Err(ProgressError::NoUnits)));
  }
}
