//! Order priority score.
//!
//! The score is the sum of an urgency contribution, taken from the tier the
//! due date falls into, and a size bonus for large remaining workloads. A
//! manual hint can only raise the result. Scores live in `0..=5`.

use chrono::NaiveDate;
use serde::Serialize;

use crate::config::PriorityConfig;
use crate::models::{Order, MAX_PRIORITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyTier {
  High,
  Medium,
  Low,
  None,
}

/// How a score was reached, for logging and presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
  pub days_until_due: i64,
  pub tier: UrgencyTier,
  pub urgency_points: u8,
  pub size_bonus: u8,
  pub raw: u8,
  pub manual: Option<u8>,
  pub score: u8,
}

/// Days from `today` to the due date. Overdue orders count as due today.
pub fn days_until_due(due_date: NaiveDate, today: NaiveDate) -> i64 {
  (due_date - today).num_days().max(0)
}

pub fn tier(days_until_due: i64, config: &PriorityConfig) -> UrgencyTier {
  let [high, medium, low] = config.urgency_thresholds;
  if days_until_due <= high {
    UrgencyTier::High
  } else if days_until_due <= medium {
    UrgencyTier::Medium
  } else if days_until_due <= low {
    UrgencyTier::Low
  } else {
    UrgencyTier::None
  }
}

fn tier_points(tier: UrgencyTier, config: &PriorityConfig) -> u8 {
  let [high, medium, low] = config.urgency_scores;
  match tier {
    UrgencyTier::High => high,
    UrgencyTier::Medium => medium,
    UrgencyTier::Low => low,
    UrgencyTier::None => 0,
  }
}

pub fn explain(order: &Order, config: &PriorityConfig, today: NaiveDate) -> Breakdown {
  let days = days_until_due(order.due_date, today);
  let tier = tier(days, config);
  let urgency_points = tier_points(tier, config);
  let size_bonus = u8::from(order.remaining_hours() >= config.size_threshold);
  let raw = urgency_points.saturating_add(size_bonus).min(MAX_PRIORITY);
  let manual = order.manual_priority.map(|p| p.min(MAX_PRIORITY));
  let score = manual.map_or(raw, |hint| raw.max(hint)).min(MAX_PRIORITY);
  Breakdown { days_until_due: days, tier, urgency_points, size_bonus, raw, manual, score }
}

pub fn score(order: &Order, config: &PriorityConfig, today: NaiveDate) -> u8 {
  explain(order, config, today).score
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
  }

  fn order(due_in: i64, hours: u32, manual: Option<u8>) -> Order {
    Order {
      code: "X".into(),
      description: String::new(),
      ordered_qty: hours,
      qty_to_deliver: hours,
      residual_value: 0.0,
      cycle_time: 1.0,
      manual_priority: manual,
      doc_number: "1".into(),
      doc_date: today(),
      due_date: today() + Duration::days(due_in),
      priority: 0,
    }
  }

  #[test]
  fn urgent_large_order_scores_four() {
    let b = explain(&order(1, 10, None), &PriorityConfig::default(), today());
    assert_eq!(b.tier, UrgencyTier::High);
    assert_eq!(b.urgency_points, 3);
    assert_eq!(b.size_bonus, 1);
    assert_eq!(b.score, 4);
  }

  #[test]
  fn manual_hint_raises_a_distant_order() {
    let b = explain(&order(20, 2, Some(5)), &PriorityConfig::default(), today());
    assert_eq!(b.tier, UrgencyTier::None);
    assert_eq!(b.raw, 0);
    assert_eq!(b.score, 5);
  }

  #[test]
  fn manual_hint_never_lowers() {
    let config = PriorityConfig::default();
    for hint in 0..=5u8 {
      let o = order(0, 20, Some(hint));
      let b = explain(&o, &config, today());
      assert_eq!(b.score, b.raw.max(hint));
      assert!(b.score >= 4);
    }
  }

  #[test]
  fn tier_boundaries_are_inclusive() {
    let config = PriorityConfig::default();
    assert_eq!(tier(2, &config), UrgencyTier::High);
    assert_eq!(tier(3, &config), UrgencyTier::Medium);
    assert_eq!(tier(5, &config), UrgencyTier::Medium);
    assert_eq!(tier(10, &config), UrgencyTier::Low);
    assert_eq!(tier(11, &config), UrgencyTier::None);
  }

  #[test]
  fn overdue_orders_are_highest_urgency() {
    let b = explain(&order(-7, 1, None), &PriorityConfig::default(), today());
    assert_eq!(b.days_until_due, 0);
    assert_eq!(b.tier, UrgencyTier::High);
    assert_eq!(b.score, 3);
  }

  #[test]
  fn size_bonus_starts_at_the_threshold() {
    let config = PriorityConfig::default();
    assert_eq!(explain(&order(30, 8, None), &config, today()).score, 1);
    assert_eq!(explain(&order(30, 7, None), &config, today()).score, 0);
  }

  #[test]
  fn score_stays_in_range_for_all_inputs() {
    let config = PriorityConfig {
      urgency_thresholds: [1, 2, 3],
      urgency_scores: [5, 5, 5],
      size_threshold: 0.0,
    };
    for due_in in -3..6 {
      for manual in [None, Some(0), Some(5)] {
        let s = score(&order(due_in, 3, manual), &config, today());
        assert!(s <= 5);
      }
    }
  }
}
