//! The planner agent: single owner of orders, allocations and the capacity
//! snapshot. Runs the bid/award cycle and publishes a snapshot whenever a
//! cycle settles.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocation::{self, Award, Bid, Demand};
use crate::config::{Config, PriorityConfig};
use crate::events::{
  AllocationAward, AllocationClosed, AllocationRevoked, BidRequest, BidResponse, FeedEvent, LamportClock,
  OrderCreated, OrderRemoved, OrderUpdated, ProgressUpdate, Stamp,
};
use crate::ingest::{self, OrderRecord};
use crate::models::{Allocation, AllocationState, Order, Worker, EPSILON};
use crate::priority;
use crate::snapshot::{OrderStatus, Rejection, ScheduleSnapshot, WorkerLoad};
use crate::worker_agent::{WorkerAgent, WorkerHandle, WorkerMessage};

const RECENT_LIMIT: usize = 100;

#[derive(Debug)]
pub enum PlannerEvent {
  Feed(FeedEvent),
  Progress(ProgressUpdate),
  /// Timer or operator request to re-evaluate priorities and re-plan.
  Replan,
  Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CyclePhase {
  Idle,
  Requesting,
  Collecting,
  Awarding,
  Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
  Settled,
  Superseded,
}

/// Source of the current date for urgency scoring.
pub type Today = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub fn system_today() -> Today {
  Arc::new(|| Local::now().date_naive())
}

#[derive(Debug, Clone)]
pub struct PlannerSettings {
  pub priority: PriorityConfig,
  pub default_cycle_time: f64,
  pub bid_timeout: Duration,
  pub replan_interval: Duration,
}

impl From<&Config> for PlannerSettings {
  fn from(config: &Config) -> Self {
    Self {
      priority: config.priority.clone(),
      default_cycle_time: config.default_cycle_time,
      bid_timeout: config.bid_timeout,
      replan_interval: config.replan_interval,
    }
  }
}

/// Cloneable entry point into the planner.
#[derive(Debug, Clone)]
pub struct PlannerHandle {
  tx: mpsc::Sender<PlannerEvent>,
  snapshots: watch::Receiver<Arc<ScheduleSnapshot>>,
}

impl PlannerHandle {
  pub async fn send(&self, event: PlannerEvent) -> anyhow::Result<()> {
    self
      .tx
      .send(event)
      .await
      .map_err(|_| anyhow::anyhow!("planner inbox closed"))
  }

  pub async fn feed(&self, event: FeedEvent) -> anyhow::Result<()> {
    self.send(PlannerEvent::Feed(event)).await
  }

  pub async fn replan(&self) -> anyhow::Result<()> {
    self.send(PlannerEvent::Replan).await
  }

  pub async fn shutdown(&self) -> anyhow::Result<()> {
    self.send(PlannerEvent::Shutdown).await
  }

  pub fn sender(&self) -> mpsc::Sender<PlannerEvent> {
    self.tx.clone()
  }

  /// Last settled snapshot.
  pub fn snapshot(&self) -> Arc<ScheduleSnapshot> {
    self.snapshots.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<Arc<ScheduleSnapshot>> {
    self.snapshots.clone()
  }
}

/// All running agents of one scheduler instance.
pub struct Agents {
  pub planner: PlannerHandle,
  pub workers: Vec<WorkerHandle>,
  pub tasks: Vec<JoinHandle<()>>,
}

/// Starts one worker agent per configured worker and the planner agent.
pub fn spawn_agents(config: &Config, today: Today) -> Agents {
  let (tx, inbox) = mpsc::channel(config.channel_capacity);
  let mut tasks = Vec::with_capacity(config.workers.len() + 1);
  let mut workers = Vec::with_capacity(config.workers.len());
  let mut ledger = Vec::with_capacity(config.workers.len());

  for def in &config.workers {
    let worker = Worker::from_def(def, config.horizon_days);
    let (handle, task) = WorkerAgent::spawn(worker.clone(), tx.clone(), config.channel_capacity);
    ledger.push(worker);
    workers.push(handle);
    tasks.push(task);
  }

  let (publisher, snapshots) = watch::channel(Arc::new(ScheduleSnapshot::empty(&ledger)));
  let agent = PlannerAgent::new(PlannerSettings::from(config), today, inbox, &workers, ledger, publisher);
  tasks.push(tokio::spawn(agent.run()));

  Agents {
    planner: PlannerHandle { tx, snapshots },
    workers,
    tasks,
  }
}

pub struct PlannerAgent {
  settings: PlannerSettings,
  today: Today,
  inbox: mpsc::Receiver<PlannerEvent>,
  /// Events that arrived during a cycle and superseded it.
  pending: VecDeque<PlannerEvent>,
  workers: BTreeMap<u32, WorkerHandle>,
  ledger: BTreeMap<u32, Worker>,
  orders: BTreeMap<String, Order>,
  allocations: BTreeMap<(String, u32), Allocation>,
  recent: VecDeque<Allocation>,
  rejected: BTreeMap<String, Rejection>,
  clock: LamportClock,
  cycle: u64,
  phase: CyclePhase,
  dirty: bool,
  stopping: bool,
  publisher: watch::Sender<Arc<ScheduleSnapshot>>,
}

impl PlannerAgent {
  pub fn new(
    settings: PlannerSettings,
    today: Today,
    inbox: mpsc::Receiver<PlannerEvent>,
    workers: &[WorkerHandle],
    ledger: Vec<Worker>,
    publisher: watch::Sender<Arc<ScheduleSnapshot>>,
  ) -> Self {
    Self {
      settings,
      today,
      inbox,
      pending: VecDeque::new(),
      workers: workers.iter().map(|w| (w.id, w.clone())).collect(),
      ledger: ledger.into_iter().map(|w| (w.id, w)).collect(),
      orders: BTreeMap::new(),
      allocations: BTreeMap::new(),
      recent: VecDeque::new(),
      rejected: BTreeMap::new(),
      clock: LamportClock::default(),
      cycle: 0,
      phase: CyclePhase::Idle,
      dirty: false,
      stopping: false,
      publisher,
    }
  }

  pub async fn run(mut self) {
    info!(workers = self.workers.len(), "planner agent started");
    let mut ticker = tokio::time::interval(self.settings.replan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    while !self.stopping {
      let event = tokio::select! {
        event = self.inbox.recv() => match event {
          Some(event) => event,
          None => break,
        },
        _ = ticker.tick() => PlannerEvent::Replan,
      };
      self.apply(event).await;
      // Triggers that piled up while we were busy collapse into one cycle.
      while let Ok(event) = self.inbox.try_recv() {
        self.apply(event).await;
      }
      if self.dirty && !self.stopping {
        self.run_until_settled().await;
      }
    }
    info!(cycle = self.cycle, "planner agent stopped");
  }

  async fn run_until_settled(&mut self) {
    loop {
      while let Some(event) = self.pending.pop_front() {
        self.apply(event).await;
      }
      while let Ok(event) = self.inbox.try_recv() {
        self.apply(event).await;
      }
      if self.stopping {
        return;
      }
      self.dirty = false;
      match self.run_cycle().await {
        CycleOutcome::Settled => {
          self.publish();
          self.phase = CyclePhase::Idle;
          return;
        }
        CycleOutcome::Superseded => continue,
      }
    }
  }

  async fn apply(&mut self, event: PlannerEvent) {
    match event {
      PlannerEvent::Feed(feed) => {
        self.clock.observe(feed.stamp());
        match feed {
          FeedEvent::OrderCreated(created) => self.on_created(created).await,
          FeedEvent::OrderUpdated(updated) => self.on_updated(updated).await,
          FeedEvent::OrderRemoved(removed) => self.on_removed(removed).await,
        }
      }
      PlannerEvent::Progress(update) => {
        self.clock.observe(update.stamp);
        self.on_progress(update).await;
      }
      PlannerEvent::Replan => self.dirty = true,
      PlannerEvent::Shutdown => self.stopping = true,
    }
  }

  async fn on_created(&mut self, created: OrderCreated) {
    let code = created.record.code.as_deref().unwrap_or_default().trim().to_string();
    let resolved = ingest::resolve(&created.record, self.settings.default_cycle_time);
    self.accept(code, resolved, created.stamp).await;
  }

  async fn on_updated(&mut self, mut updated: OrderUpdated) {
    updated.code = updated.code.trim().to_string();
    let resolved = match self.orders.get(&updated.code) {
      Some(order) => ingest::apply_patch(order, &updated.patch, self.settings.default_cycle_time),
      None => {
        debug!(order = %updated.code, "update for unknown order, treating as creation");
        ingest::resolve(&OrderRecord::from_patch(&updated.code, &updated.patch), self.settings.default_cycle_time)
      }
    };
    self.accept(updated.code, resolved, updated.stamp).await;
  }

  async fn on_removed(&mut self, mut removed: OrderRemoved) {
    removed.code = removed.code.trim().to_string();
    self.rejected.remove(&removed.code);
    if self.orders.contains_key(&removed.code) {
      info!(order = %removed.code, "order withdrawn");
      self.drop_order(&removed.code, AllocationState::Cancelled).await;
      self.dirty = true;
    } else {
      debug!(order = %removed.code, "removal of unknown order ignored");
    }
  }

  async fn accept(&mut self, code: String, resolved: Result<Order, crate::error::IngestError>, stamp: Stamp) {
    match resolved {
      Ok(mut order) => {
        self.rejected.remove(&order.code);
        if order.is_done() {
          if self.orders.contains_key(&order.code) {
            info!(order = %order.code, "order fully delivered");
            self.drop_order(&order.code, AllocationState::Completed).await;
            self.dirty = true;
          }
          return;
        }
        order.priority = priority::score(&order, &self.settings.priority, (self.today)());
        info!(order = %order.code, priority = order.priority, hours = order.remaining_hours(), "order accepted");
        let code = order.code.clone();
        self.orders.insert(code.clone(), order);
        self.reconcile(&code).await;
        self.dirty = true;
      }
      Err(err) => {
        warn!(order = %code, error = %err, "order record rejected");
        self.rejected.insert(code.clone(), Rejection { code: code.clone(), reason: err.to_string(), stamp });
        if self.orders.contains_key(&code) {
          self.drop_order(&code, AllocationState::Cancelled).await;
          self.dirty = true;
        }
      }
    }
  }

  async fn on_progress(&mut self, update: ProgressUpdate) {
    let key = (update.order_code.clone(), update.worker_id);
    let (Some(order), Some(allocation)) = (self.orders.get_mut(&update.order_code), self.allocations.get_mut(&key))
    else {
      warn!(order = %update.order_code, worker = update.worker_id, "progress for unknown allocation dropped");
      return;
    };

    let booked = allocation.record_work(update.units as f64 * order.cycle_time);
    order.qty_to_deliver = order.qty_to_deliver.saturating_sub(update.units);
    let order_done = order.is_done();
    let allocation_done = !allocation.state.is_active();
    if let Some(worker) = self.ledger.get_mut(&update.worker_id) {
      worker.release(booked);
    }
    info!(
      order = %update.order_code,
      worker = update.worker_id,
      units = update.units,
      progress = allocation.progress,
      "progress recorded"
    );

    if allocation_done {
      if let Some(done) = self.allocations.remove(&key) {
        self.retire(done);
      }
      let closed = AllocationClosed {
        stamp: self.clock.tick(),
        order_code: update.order_code.clone(),
        worker_id: update.worker_id,
      };
      self.notify(update.worker_id, WorkerMessage::Close(closed)).await;
    }

    if order_done {
      info!(order = %update.order_code, "order fully delivered");
      self.drop_order(&update.order_code, AllocationState::Completed).await;
    } else {
      self.reconcile(&update.order_code).await;
    }
    if update.units > 0 {
      self.dirty = true;
    }
  }

  /// Removes an order and closes all of its active allocations.
  async fn drop_order(&mut self, code: &str, state: AllocationState) {
    self.orders.remove(code);
    let keys: Vec<(String, u32)> = self.allocations.keys().filter(|(c, _)| c == code).cloned().collect();
    for key in keys {
      let Some(mut allocation) = self.allocations.remove(&key) else { continue };
      if let Some(worker) = self.ledger.get_mut(&key.1) {
        worker.release(allocation.outstanding_hours());
      }
      allocation.state = state;
      self.retire(allocation);
      let closed = AllocationClosed { stamp: self.clock.tick(), order_code: key.0.clone(), worker_id: key.1 };
      self.notify(key.1, WorkerMessage::Close(closed)).await;
    }
  }

  /// Takes back allocated hours the order no longer needs. Allocations not
  /// yet started go first, smaller ones before larger ones.
  async fn reconcile(&mut self, code: &str) {
    let Some(order) = self.orders.get(code) else { return };
    let needed = order.remaining_hours();
    let mut held: Vec<&Allocation> = self.allocations.values().filter(|a| a.order_code == code).collect();
    let outstanding: f64 = held.iter().map(|a| a.outstanding_hours()).sum();
    let mut excess = outstanding - needed;
    if excess <= EPSILON {
      return;
    }

    held.sort_by(|a, b| {
      (a.state == AllocationState::InProgress)
        .cmp(&(b.state == AllocationState::InProgress))
        .then(a.outstanding_hours().total_cmp(&b.outstanding_hours()))
        .then(b.worker_id.cmp(&a.worker_id))
    });
    let order_of_revocation: Vec<(String, u32)> = held.iter().map(|a| a.key()).collect();

    for key in order_of_revocation {
      if excess <= EPSILON {
        break;
      }
      let Some(allocation) = self.allocations.get_mut(&key) else { continue };
      let trimmed = allocation.trim(excess);
      excess -= trimmed;
      let closed = !allocation.state.is_active();
      if let Some(worker) = self.ledger.get_mut(&key.1) {
        worker.release(trimmed);
      }
      info!(order = %key.0, worker = key.1, hours = trimmed, "allocation trimmed");
      if closed {
        if let Some(done) = self.allocations.remove(&key) {
          self.retire(done);
        }
      }
      let revoked = AllocationRevoked { stamp: self.clock.tick(), order_code: key.0.clone(), worker_id: key.1, hours: trimmed };
      self.notify(key.1, WorkerMessage::Revoke(revoked)).await;
    }
  }

  fn retire(&mut self, allocation: Allocation) {
    self.recent.push_front(allocation);
    self.recent.truncate(RECENT_LIMIT);
  }

  async fn notify(&self, worker_id: u32, message: WorkerMessage) {
    match self.workers.get(&worker_id) {
      Some(handle) => {
        if handle.send(message).await.is_err() {
          warn!(worker = worker_id, "worker inbox closed");
        }
      }
      None => warn!(worker = worker_id, "message for unknown worker dropped"),
    }
  }

  fn rescore(&mut self) {
    let today = (self.today)();
    for order in self.orders.values_mut() {
      order.priority = priority::score(order, &self.settings.priority, today);
    }
  }

  fn outstanding_by_order(&self) -> BTreeMap<&str, f64> {
    let mut held: BTreeMap<&str, f64> = BTreeMap::new();
    for allocation in self.allocations.values() {
      *held.entry(allocation.order_code.as_str()).or_default() += allocation.outstanding_hours();
    }
    held
  }

  fn demands(&self) -> Vec<Demand> {
    let held = self.outstanding_by_order();
    self
      .orders
      .values()
      .map(|order| Demand {
        code: order.code.clone(),
        priority: order.priority,
        due_date: order.due_date,
        hours: (order.remaining_hours() - held.get(order.code.as_str()).copied().unwrap_or(0.0)).max(0.0),
      })
      .collect()
  }

  async fn run_cycle(&mut self) -> CycleOutcome {
    self.cycle += 1;
    let cycle = self.cycle;
    self.phase = CyclePhase::Requesting;
    self.rescore();
    let worklist = allocation::build_worklist(self.demands());
    info!(cycle, orders = worklist.len(), "cycle started");

    for demand in worklist {
      self.phase = CyclePhase::Requesting;
      let request = BidRequest {
        stamp: self.clock.tick(),
        cycle,
        order_code: demand.code.clone(),
        hours: demand.hours,
        due_date: demand.due_date,
      };

      self.phase = CyclePhase::Collecting;
      let responses = self.collect_bids(&request).await;

      self.phase = CyclePhase::Awarding;
      let bids: Vec<Bid> = responses
        .into_iter()
        .map(|(worker_id, response)| {
          let offered = match response {
            Some(response) => {
              self.clock.observe(response.stamp);
              response.hours
            }
            None => 0.0,
          };
          let available = self.ledger.get(&worker_id).map_or(0.0, Worker::available_hours);
          Bid { worker_id, hours: allocation::clamp_bid(offered, demand.hours, available) }
        })
        .collect();
      let awards = allocation::award(demand.hours, &bids);
      self.grant(cycle, &demand, &awards).await;

      let covered: f64 = awards.iter().map(|a| a.hours).sum();
      if demand.hours - covered > EPSILON {
        debug!(cycle, order = %demand.code, uncovered = demand.hours - covered, "order partially covered");
      }

      if let Ok(event) = self.inbox.try_recv() {
        info!(cycle, phase = ?self.phase, order = %demand.code, "newer input arrived, cycle superseded");
        self.pending.push_back(event);
        self.phase = CyclePhase::Idle;
        return CycleOutcome::Superseded;
      }
    }

    self.phase = CyclePhase::Settled;
    CycleOutcome::Settled
  }

  /// Asks every worker for a bid and waits at most the bid timeout. Late or
  /// missing answers count as zero.
  async fn collect_bids(&self, request: &BidRequest) -> Vec<(u32, Option<BidResponse>)> {
    let window = self.settings.bid_timeout;
    let asks = self.workers.values().map(|worker| {
      let request = request.clone();
      async move {
        let worker_id = worker.id;
        let cycle = request.cycle;
        let order_code = request.order_code.clone();
        let ask = async {
          let (reply, rx) = oneshot::channel();
          worker.send(WorkerMessage::Bid { request, reply }).await.ok()?;
          rx.await.ok()
        };
        match tokio::time::timeout(window, ask).await {
          Ok(Some(response)) if response.cycle == cycle && response.order_code == order_code => {
            (worker_id, Some(response))
          }
          Ok(Some(_)) => {
            warn!(worker = worker_id, order = %order_code, "bid for another request ignored");
            (worker_id, None)
          }
          Ok(None) => {
            warn!(worker = worker_id, order = %order_code, "worker unreachable, zero bid");
            (worker_id, None)
          }
          Err(_) => {
            warn!(worker = worker_id, order = %order_code, "bid timed out, zero bid");
            (worker_id, None)
          }
        }
      }
    });
    join_all(asks).await
  }

  async fn grant(&mut self, cycle: u64, demand: &Demand, awards: &[Award]) {
    let Some(cycle_time) = self.orders.get(&demand.code).map(|o| o.cycle_time) else { return };
    for award in awards {
      let Some(worker) = self.ledger.get_mut(&award.worker_id) else { continue };
      let hours = worker.commit(award.hours);
      if hours <= EPSILON {
        continue;
      }

      let key = (demand.code.clone(), award.worker_id);
      self
        .allocations
        .entry(key.clone())
        .and_modify(|a| a.extend(hours))
        .or_insert_with(|| Allocation::proposed(demand.code.clone(), award.worker_id, hours));

      let message = WorkerMessage::Award(AllocationAward {
        stamp: self.clock.tick(),
        cycle,
        order_code: demand.code.clone(),
        worker_id: award.worker_id,
        hours,
        cycle_time,
      });
      let delivered = match self.workers.get(&award.worker_id) {
        Some(handle) => handle.send(message).await.is_ok(),
        None => false,
      };

      let Some(allocation) = self.allocations.get_mut(&key) else { continue };
      if delivered {
        allocation.confirm();
        info!(cycle, order = %demand.code, worker = award.worker_id, hours, "allocation awarded");
        continue;
      }

      warn!(cycle, order = %demand.code, worker = award.worker_id, "award undeliverable, cancelled");
      allocation.trim(hours);
      let closed = !allocation.state.is_active();
      if !closed {
        allocation.state = if allocation.worked_hours > EPSILON {
          AllocationState::InProgress
        } else {
          AllocationState::Awarded
        };
      }
      if let Some(worker) = self.ledger.get_mut(&award.worker_id) {
        worker.release(hours);
      }
      if closed {
        if let Some(done) = self.allocations.remove(&key) {
          self.retire(done);
        }
      }
    }
  }

  fn publish(&mut self) {
    let held = self.outstanding_by_order();
    let mut orders: Vec<OrderStatus> = self
      .orders
      .values()
      .map(|order| {
        let remaining = order.remaining_hours();
        let allocated = held.get(order.code.as_str()).copied().unwrap_or(0.0);
        OrderStatus {
          order: order.clone(),
          remaining_hours: remaining,
          allocated_hours: allocated,
          unallocated_hours: (remaining - allocated).max(0.0),
          completion: order.completion(),
        }
      })
      .collect();
    orders.sort_by(|a, b| {
      b.order
        .priority
        .cmp(&a.order.priority)
        .then_with(|| a.order.due_date.cmp(&b.order.due_date))
        .then_with(|| a.order.code.cmp(&b.order.code))
    });

    let snapshot = ScheduleSnapshot {
      id: Uuid::new_v4(),
      cycle: self.cycle,
      settled_at: Some(Utc::now()),
      stamp: self.clock.now(),
      orders,
      allocations: self.allocations.values().cloned().collect(),
      recent: self.recent.iter().cloned().collect(),
      workers: self.ledger.values().map(WorkerLoad::from).collect(),
      rejected: self.rejected.values().cloned().collect(),
    };
    info!(
      cycle = snapshot.cycle,
      orders = snapshot.orders.len(),
      allocations = snapshot.allocations.len(),
      "cycle settled"
    );
    self.publisher.send_replace(Arc::new(snapshot));
  }
}
