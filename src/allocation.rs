//! Capacity matching for one planning cycle.
//!
//! A cycle walks the worklist one order at a time. For each order every
//! worker bids the hours it can still give, the bids are clamped to what
//! the planner knows the worker has left, and the order is covered greedily
//! from the largest bid down. Whatever stays uncovered is retried next
//! cycle.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::EPSILON;

/// Unallocated work of one order as seen at the start of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Demand {
  pub code: String,
  pub priority: u8,
  pub due_date: NaiveDate,
  pub hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bid {
  pub worker_id: u32,
  pub hours: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Award {
  pub worker_id: u32,
  pub hours: f64,
}

/// Priority descending, then due date ascending, then code ascending.
/// Codes are unique, so this is a total order over the active set.
pub fn worklist_order(a: &Demand, b: &Demand) -> Ordering {
  b.priority
    .cmp(&a.priority)
    .then_with(|| a.due_date.cmp(&b.due_date))
    .then_with(|| a.code.cmp(&b.code))
}

pub fn build_worklist(demands: impl IntoIterator<Item = Demand>) -> Vec<Demand> {
  let mut worklist: Vec<Demand> = demands.into_iter().filter(|d| d.hours > EPSILON).collect();
  worklist.sort_by(worklist_order);
  worklist
}

/// Bounds an offered bid to `[0, min(requested, available)]`. Anything that
/// is not a finite number counts as zero.
pub fn clamp_bid(offered: f64, requested: f64, available: f64) -> f64 {
  if !offered.is_finite() || !requested.is_finite() || !available.is_finite() {
    return 0.0;
  }
  let ceiling = requested.min(available).max(0.0);
  let bid = offered.clamp(0.0, ceiling);
  if bid < EPSILON { 0.0 } else { bid }
}

/// Covers `needed` hours greedily from the largest bid down. Ties go to the
/// lower worker id. Zero bids receive nothing.
pub fn award(needed: f64, bids: &[Bid]) -> Vec<Award> {
  let mut ranked: Vec<Bid> = bids.iter().copied().filter(|b| b.hours > EPSILON).collect();
  ranked.sort_by(|a, b| b.hours.total_cmp(&a.hours).then(a.worker_id.cmp(&b.worker_id)));

  let mut remaining = needed.max(0.0);
  let mut awards = Vec::new();
  for bid in ranked {
    if remaining <= EPSILON {
      break;
    }
    let hours = bid.hours.min(remaining);
    remaining -= hours;
    awards.push(Award { worker_id: bid.worker_id, hours });
  }
  awards
}

/// Result of planning a full cycle without the message exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CyclePlan {
  /// Awards in worklist order.
  pub awards: Vec<(String, Award)>,
  /// Orders left with uncovered hours.
  pub uncovered: BTreeMap<String, f64>,
}

/// Runs the whole cycle synchronously: every worker bids
/// `min(available, requested)` and capacity is drawn down as orders are
/// awarded. The planner agent produces the same awards through the bid
/// protocol when no bid times out.
pub fn plan_cycle(demands: impl IntoIterator<Item = Demand>, capacities: &mut BTreeMap<u32, f64>) -> CyclePlan {
  let mut plan = CyclePlan::default();
  for demand in build_worklist(demands) {
    let bids: Vec<Bid> = capacities
      .iter()
      .map(|(&worker_id, &available)| Bid {
        worker_id,
        hours: clamp_bid(available, demand.hours, available),
      })
      .collect();

    let awards = award(demand.hours, &bids);
    let covered: f64 = awards.iter().map(|a| a.hours).sum();
    for a in &awards {
      if let Some(available) = capacities.get_mut(&a.worker_id) {
        *available = (*available - a.hours).max(0.0);
      }
    }
    let left = demand.hours - covered;
    if left > EPSILON {
      plan.uncovered.insert(demand.code.clone(), left);
    }
    plan.awards.extend(awards.into_iter().map(|a| (demand.code.clone(), a)));
  }
  plan
}
