use std::collections::HashSet;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Tunables of the priority score.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityConfig {
  /// Ascending day counts bounding the high, medium and low urgency tiers.
  pub urgency_thresholds: [i64; 3],
  /// Points for the high, medium and low tiers. Orders beyond the last
  /// threshold score zero.
  pub urgency_scores: [u8; 3],
  /// Remaining work hours at or above which an order gets the size bonus.
  pub size_threshold: f64,
}

impl Default for PriorityConfig {
  fn default() -> Self {
    Self {
      urgency_thresholds: [2, 5, 10],
      urgency_scores: [3, 2, 1],
      size_threshold: 8.0,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerDef {
  pub id: u32,
  #[serde(default)]
  pub name: String,
  pub hours_per_day: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub database_url: Option<String>,
  pub rabbitmq_url: Option<String>,
  pub order_file: Option<PathBuf>,
  pub order_poll: Duration,
  pub workers: Vec<WorkerDef>,
  pub horizon_days: u32,
  pub default_cycle_time: f64,
  pub priority: PriorityConfig,
  pub bid_timeout: Duration,
  pub replan_interval: Duration,
  pub channel_capacity: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server_port: 8080,
      database_url: None,
      rabbitmq_url: None,
      order_file: None,
      order_poll: Duration::from_secs(60),
      workers: default_workers(3, 8.0),
      horizon_days: 30,
      default_cycle_time: 1.0,
      priority: PriorityConfig::default(),
      bid_timeout: Duration::from_millis(250),
      replan_interval: Duration::from_secs(300),
      channel_capacity: 256,
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  /// Builds the configuration from an arbitrary key lookup. Unset keys
  /// fall back to the defaults; set but unparsable keys are errors.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let defaults = Self::default();
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let hours_per_day: f64 = parse(&lookup, "HOURS_PER_DAY", 8.0)?;
    let workers = match non_empty("WORKERS_FILE") {
      Some(path) => load_workers_file(&path)?,
      None => {
        let count: i64 = parse(&lookup, "WORKER_COUNT", 3)?;
        if count <= 0 {
          return Err(ConfigError::NoWorkers);
        }
        default_workers(count as u32, hours_per_day)
      }
    };
    validate_workers(&workers)?;

    let horizon_days: u32 = parse(&lookup, "HORIZON_DAYS", defaults.horizon_days)?;
    if horizon_days == 0 {
      return Err(invalid("HORIZON_DAYS", "0", "must be at least one day"));
    }

    let default_cycle_time: f64 = parse(&lookup, "DEFAULT_CYCLE_TIME", defaults.default_cycle_time)?;
    if !(default_cycle_time > 0.0) || !default_cycle_time.is_finite() {
      return Err(invalid("DEFAULT_CYCLE_TIME", default_cycle_time, "must be positive"));
    }

    let thresholds = match non_empty("URGENCY_THRESHOLDS") {
      Some(raw) => parse_list::<i64>("URGENCY_THRESHOLDS", &raw)?,
      None => defaults.priority.urgency_thresholds.to_vec(),
    };
    let urgency_thresholds: [i64; 3] = match thresholds.as_slice() {
      [a, b, c] if *a >= 0 && a < b && b < c => [*a, *b, *c],
      _ => return Err(ConfigError::Thresholds(thresholds.clone())),
    };

    let urgency_scores = match non_empty("URGENCY_SCORES") {
      Some(raw) => {
        let scores = parse_list::<u8>("URGENCY_SCORES", &raw)?;
        match scores.as_slice() {
          [h, m, l] if *h <= 5 && *m <= 5 && *l <= 5 => [*h, *m, *l],
          _ => return Err(invalid("URGENCY_SCORES", raw, "expected three values in 0..=5")),
        }
      }
      None => defaults.priority.urgency_scores,
    };

    let size_threshold: f64 = parse(&lookup, "SIZE_THRESHOLD", defaults.priority.size_threshold)?;
    if size_threshold < 0.0 || !size_threshold.is_finite() {
      return Err(invalid("SIZE_THRESHOLD", size_threshold, "must be non-negative"));
    }

    let channel_capacity: usize = parse(&lookup, "CHANNEL_CAPACITY", defaults.channel_capacity)?;
    if channel_capacity == 0 {
      return Err(invalid("CHANNEL_CAPACITY", "0", "must be at least 1"));
    }

    let replan_secs: u64 = parse(&lookup, "REPLAN_INTERVAL_SECS", defaults.replan_interval.as_secs())?;
    if replan_secs == 0 {
      return Err(invalid("REPLAN_INTERVAL_SECS", "0", "must be at least 1"));
    }
    let poll_secs: u64 = parse(&lookup, "ORDER_POLL_SECS", defaults.order_poll.as_secs())?;
    if poll_secs == 0 {
      return Err(invalid("ORDER_POLL_SECS", "0", "must be at least 1"));
    }

    Ok(Self {
      server_port: parse(&lookup, "SERVER_PORT", defaults.server_port)?,
      database_url: non_empty("DATABASE_URL"),
      rabbitmq_url: non_empty("RABBITMQ_URL"),
      order_file: non_empty("ORDER_FILE").map(PathBuf::from),
      order_poll: Duration::from_secs(poll_secs),
      workers,
      horizon_days,
      default_cycle_time,
      priority: PriorityConfig { urgency_thresholds, urgency_scores, size_threshold },
      bid_timeout: Duration::from_millis(parse(&lookup, "BID_TIMEOUT_MS", defaults.bid_timeout.as_millis() as u64)?),
      replan_interval: Duration::from_secs(replan_secs),
      channel_capacity,
    })
  }
}

fn default_workers(count: u32, hours_per_day: f64) -> Vec<WorkerDef> {
  (1..=count)
    .map(|id| WorkerDef { id, name: format!("Worker {}", id), hours_per_day })
    .collect()
}

fn load_workers_file(path: &str) -> Result<Vec<WorkerDef>, ConfigError> {
  let raw = std::fs::read_to_string(path)
    .map_err(|source| ConfigError::WorkersFile { path: path.to_string(), source })?;
  let mut workers: Vec<WorkerDef> = serde_json::from_str(&raw)
    .map_err(|source| ConfigError::WorkersJson { path: path.to_string(), source })?;
  for w in workers.iter_mut().filter(|w| w.name.is_empty()) {
    w.name = format!("Worker {}", w.id);
  }
  Ok(workers)
}

fn validate_workers(workers: &[WorkerDef]) -> Result<(), ConfigError> {
  if workers.is_empty() {
    return Err(ConfigError::NoWorkers);
  }
  let mut seen = HashSet::new();
  for w in workers {
    if !seen.insert(w.id) {
      return Err(ConfigError::DuplicateWorker(w.id));
    }
    if !(w.hours_per_day > 0.0) || !w.hours_per_day.is_finite() {
      return Err(invalid("hours_per_day", w.hours_per_day, "must be positive"));
    }
  }
  Ok(())
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
  T: FromStr,
  T::Err: Display,
  F: Fn(&str) -> Option<String>,
{
  match lookup(key).filter(|v| !v.trim().is_empty()) {
    Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, raw.clone(), e)),
    None => Ok(default),
  }
}

fn parse_list<T>(key: &'static str, raw: &str) -> Result<Vec<T>, ConfigError>
where
  T: FromStr,
  T::Err: Display,
{
  raw
    .split(',')
    .map(|part| part.trim().parse().map_err(|e: T::Err| invalid(key, raw, e)))
    .collect()
}

fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> ConfigError {
  ConfigError::Invalid { key, value: value.to_string(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key: &str| map.get(key).cloned()
  }

  #[test]
  fn defaults_when_nothing_is_set() {
    let config = Config::from_lookup(lookup_from(&[])).unwrap();
    assert_eq!(config.server_port, 8080);
    assert_eq!(config.workers.len(), 3);
    assert_eq!(config.workers[0].hours_per_day, 8.0);
    assert_eq!(config.priority, PriorityConfig::default());
    assert!(config.database_url.is_none());
  }

  #[test]
  fn reads_thresholds_and_workers() {
    let config = Config::from_lookup(lookup_from(&[
      ("WORKER_COUNT", "5"),
      ("HOURS_PER_DAY", "7.5"),
      ("URGENCY_THRESHOLDS", "1, 3, 7"),
      ("SIZE_THRESHOLD", "12"),
      ("BID_TIMEOUT_MS", "40"),
    ]))
    .unwrap();
    assert_eq!(config.workers.len(), 5);
    assert_eq!(config.workers[4].id, 5);
    assert_eq!(config.workers[4].hours_per_day, 7.5);
    assert_eq!(config.priority.urgency_thresholds, [1, 3, 7]);
    assert_eq!(config.priority.size_threshold, 12.0);
    assert_eq!(config.bid_timeout, Duration::from_millis(40));
  }

  #[test]
  fn zero_or_negative_worker_count_is_fatal() {
    assert!(matches!(
      Config::from_lookup(lookup_from(&[("WORKER_COUNT", "0")])),
      Err(ConfigError::NoWorkers)
    ));
    assert!(matches!(
      Config::from_lookup(lookup_from(&[("WORKER_COUNT", "-2")])),
      Err(ConfigError::NoWorkers)
    ));
  }

  #[test]
  fn thresholds_must_ascend() {
    let err = Config::from_lookup(lookup_from(&[("URGENCY_THRESHOLDS", "5,2,10")])).unwrap_err();
    assert!(matches!(err, ConfigError::Thresholds(_)));
  }

  #[test]
  fn garbage_values_are_rejected() {
    let err = Config::from_lookup(lookup_from(&[("HOURS_PER_DAY", "eight")])).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "HOURS_PER_DAY", .. }));
  }

  #[test]
  fn zero_intervals_are_rejected() {
    let err = Config::from_lookup(lookup_from(&[("REPLAN_INTERVAL_SECS", "0")])).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "REPLAN_INTERVAL_SECS", .. }));
    let err = Config::from_lookup(lookup_from(&[("ORDER_POLL_SECS", "0")])).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "ORDER_POLL_SECS", .. }));
  }
}
