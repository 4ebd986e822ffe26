//! Validation and default resolution of order records coming from the
//! feeds. This is the only place optional inputs are defaulted; everything
//! downstream works with a fully resolved `Order`.

use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::IngestError;
use crate::models::{Order, MAX_PRIORITY};

/// A raw order row as delivered by a feed. All fields are optional so that
/// a broken row can be reported field by field instead of failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
  pub code: Option<String>,
  pub description: Option<String>,
  pub ordered_qty: Option<i64>,
  pub qty_to_deliver: Option<i64>,
  pub residual_value: Option<f64>,
  pub cycle_time: Option<f64>,
  pub manual_priority: Option<i64>,
  pub doc_number: Option<String>,
  pub doc_date: Option<String>,
  pub due_date: Option<String>,
}

/// Changed fields of an existing order. For `cycle_time` and
/// `manual_priority` an explicit `null` clears the value, an absent field
/// keeps it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ordered_qty: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub qty_to_deliver: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub residual_value: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
  pub cycle_time: Option<Option<f64>>,
  #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
  pub manual_priority: Option<Option<i64>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub doc_number: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub doc_date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub due_date: Option<String>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
  D: Deserializer<'de>,
  T: Deserialize<'de>,
{
  Option::<T>::deserialize(deserializer).map(Some)
}

impl OrderPatch {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  /// Fields that differ between two rows of the same order, or `None` when
  /// nothing changed.
  pub fn between(old: &OrderRecord, new: &OrderRecord) -> Option<Self> {
    fn changed<T: Clone + PartialEq>(old: &Option<T>, new: &Option<T>) -> Option<T> {
      if old != new { new.clone() } else { None }
    }
    fn changed_nullable<T: Clone + PartialEq>(old: &Option<T>, new: &Option<T>) -> Option<Option<T>> {
      if old != new { Some(new.clone()) } else { None }
    }

    let patch = Self {
      description: changed(&old.description, &new.description),
      ordered_qty: changed(&old.ordered_qty, &new.ordered_qty),
      qty_to_deliver: changed(&old.qty_to_deliver, &new.qty_to_deliver),
      residual_value: changed(&old.residual_value, &new.residual_value),
      cycle_time: changed_nullable(&old.cycle_time, &new.cycle_time),
      manual_priority: changed_nullable(&old.manual_priority, &new.manual_priority),
      doc_number: changed(&old.doc_number, &new.doc_number),
      doc_date: changed(&old.doc_date, &new.doc_date),
      due_date: changed(&old.due_date, &new.due_date),
    };
    (!patch.is_empty()).then_some(patch)
  }
}

impl OrderRecord {
  /// Record for an order code the planner has never seen, built from the
  /// fields of an update.
  pub fn from_patch(code: &str, patch: &OrderPatch) -> Self {
    Self {
      code: Some(code.to_string()),
      ..Self::default()
    }
    .overlay(patch)
  }

  pub fn overlay(mut self, patch: &OrderPatch) -> Self {
    if let Some(v) = &patch.description {
      self.description = Some(v.clone());
    }
    if let Some(v) = patch.ordered_qty {
      self.ordered_qty = Some(v);
    }
    if let Some(v) = patch.qty_to_deliver {
      self.qty_to_deliver = Some(v);
    }
    if let Some(v) = patch.residual_value {
      self.residual_value = Some(v);
    }
    if let Some(v) = patch.cycle_time {
      self.cycle_time = v;
    }
    if let Some(v) = patch.manual_priority {
      self.manual_priority = v;
    }
    if let Some(v) = &patch.doc_number {
      self.doc_number = Some(v.clone());
    }
    if let Some(v) = &patch.doc_date {
      self.doc_date = Some(v.clone());
    }
    if let Some(v) = &patch.due_date {
      self.due_date = Some(v.clone());
    }
    self
  }
}

impl From<&Order> for OrderRecord {
  fn from(order: &Order) -> Self {
    Self {
      code: Some(order.code.clone()),
      description: Some(order.description.clone()),
      ordered_qty: Some(order.ordered_qty as i64),
      qty_to_deliver: Some(order.qty_to_deliver as i64),
      residual_value: Some(order.residual_value),
      cycle_time: Some(order.cycle_time),
      manual_priority: order.manual_priority.map(i64::from),
      doc_number: Some(order.doc_number.clone()),
      doc_date: Some(order.doc_date.format("%Y-%m-%d").to_string()),
      due_date: Some(order.due_date.format("%Y-%m-%d").to_string()),
    }
  }
}

fn code_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][\w\-./ ]{0,63}$").unwrap())
}

/// Validates a record and resolves its optional fields. The returned order
/// has priority 0; scoring happens in the planner.
pub fn resolve(record: &OrderRecord, default_cycle_time: f64) -> Result<Order, IngestError> {
  let code = required(&record.code, "code")?.trim().to_string();
  if !code_pattern().is_match(&code) {
    return Err(IngestError::InvalidCode(code));
  }

  let ordered_qty = quantity(record.ordered_qty, "ordered_qty")?;
  let qty_to_deliver = quantity(record.qty_to_deliver, "qty_to_deliver")?;

  let residual_value = record.residual_value.ok_or(IngestError::MissingField("residual_value"))?;
  if !residual_value.is_finite() || residual_value < 0.0 {
    return Err(IngestError::InvalidValue(residual_value));
  }

  let cycle_time = match record.cycle_time {
    Some(hours) if hours.is_finite() && hours > 0.0 => hours,
    _ => default_cycle_time,
  };

  let manual_priority = match record.manual_priority {
    Some(p) if p < 0 => None,
    Some(p) => Some(p.min(MAX_PRIORITY as i64) as u8),
    None => None,
  };

  Ok(Order {
    code,
    description: required(&record.description, "description")?.to_string(),
    ordered_qty,
    qty_to_deliver,
    residual_value,
    cycle_time,
    manual_priority,
    doc_number: required(&record.doc_number, "doc_number")?.trim().to_string(),
    doc_date: date(&record.doc_date, "doc_date")?,
    due_date: date(&record.due_date, "due_date")?,
    priority: 0,
  })
}

/// Applies an update to an existing order and re-validates the result.
pub fn apply_patch(order: &Order, patch: &OrderPatch, default_cycle_time: f64) -> Result<Order, IngestError> {
  let mut updated = resolve(&OrderRecord::from(order).overlay(patch), default_cycle_time)?;
  updated.priority = order.priority;
  Ok(updated)
}

fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, IngestError> {
  match value.as_deref() {
    Some(v) if !v.trim().is_empty() => Ok(v),
    _ => Err(IngestError::MissingField(field)),
  }
}

fn quantity(value: Option<i64>, field: &'static str) -> Result<u32, IngestError> {
  let value = value.ok_or(IngestError::MissingField(field))?;
  u32::try_from(value).map_err(|_| IngestError::InvalidQuantity { field, value })
}

fn date(value: &Option<String>, field: &'static str) -> Result<NaiveDate, IngestError> {
  let raw = required(value, field)?.trim();
  parse_date(raw).ok_or_else(|| IngestError::InvalidDate { field, value: raw.to_string() })
}

/// Accepts ISO dates, day-first dates and ISO date-times.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
  ["%Y-%m-%d", "%d/%m/%Y", "%d.%m.%Y"]
    .iter()
    .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
    .or_else(|| {
      ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
    })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record() -> OrderRecord {
    OrderRecord {
      code: Some("ORD-1".into()),
      description: Some("Bracket".into()),
      ordered_qty: Some(10),
      qty_to_deliver: Some(8),
      residual_value: Some(120.0),
      cycle_time: None,
      manual_priority: None,
      doc_number: Some("D-77".into()),
      doc_date: Some("2024-03-01".into()),
      due_date: Some("15/03/2024".into()),
    }
  }

  #[test]
  fn missing_cycle_time_uses_default() {
    let order = resolve(&record(), 0.5).unwrap();
    assert_eq!(order.cycle_time, 0.5);
    assert_eq!(order.remaining_hours(), 4.0);
    assert_eq!(order.due_date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());

    let mut r = record();
    r.cycle_time = Some(-1.0);
    assert_eq!(resolve(&r, 0.5).unwrap().cycle_time, 0.5);
  }

  #[test]
  fn manual_priority_is_clamped_or_ignored() {
    let mut r = record();
    r.manual_priority = Some(9);
    assert_eq!(resolve(&r, 1.0).unwrap().manual_priority, Some(5));
    r.manual_priority = Some(-3);
    assert_eq!(resolve(&r, 1.0).unwrap().manual_priority, None);
  }

  #[test]
  fn malformed_records_report_the_field() {
    let mut r = record();
    r.description = None;
    assert_eq!(resolve(&r, 1.0), Err(IngestError::MissingField("description")));

    let mut r = record();
    r.qty_to_deliver = Some(-1);
    assert_eq!(
      resolve(&r, 1.0),
      Err(IngestError::InvalidQuantity { field: "qty_to_deliver", value: -1 })
    );

    let mut r = record();
    r.due_date = Some("next week".into());
    assert!(matches!(resolve(&r, 1.0), Err(IngestError::InvalidDate { field: "due_date", .. })));

    let mut r = record();
    r.code = Some("; drop table".into());
    assert!(matches!(resolve(&r, 1.0), Err(IngestError::InvalidCode(_))));
  }

  #[test]
  fn patch_between_rows_only_carries_changes() {
    let old = record();
    let mut new = record();
    assert_eq!(OrderPatch::between(&old, &new), None);

    new.qty_to_deliver = Some(3);
    new.manual_priority = Some(4);
    let patch = OrderPatch::between(&old, &new).unwrap();
    assert_eq!(patch.qty_to_deliver, Some(3));
    assert_eq!(patch.manual_priority, Some(Some(4)));
    assert_eq!(patch.description, None);

    let cleared = OrderPatch::between(&new, &old).unwrap();
    assert_eq!(cleared.manual_priority, Some(None));
  }

  #[test]
  fn patch_json_distinguishes_null_from_absent() {
    let patch: OrderPatch = serde_json::from_str(r#"{"manual_priority": null}"#).unwrap();
    assert_eq!(patch.manual_priority, Some(None));
    let patch: OrderPatch = serde_json::from_str(r#"{"qty_to_deliver": 2}"#).unwrap();
    assert_eq!(patch.manual_priority, None);
  }

  #[test]
  fn apply_patch_revalidates() {
    let order = resolve(&record(), 1.0).unwrap();
    let patch = OrderPatch { qty_to_deliver: Some(2), ..OrderPatch::default() };
    let updated = apply_patch(&order, &patch, 1.0).unwrap();
    assert_eq!(updated.qty_to_deliver, 2);
    assert_eq!(updated.description, "Bracket");

    let bad = OrderPatch { ordered_qty: Some(-5), ..OrderPatch::default() };
    assert!(apply_patch(&order, &bad, 1.0).is_err());
  }
}
