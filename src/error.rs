use thiserror::Error;

/// Startup problems. These are the only fatal errors in the service.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value for {key}: {value:?} ({reason})")]
  Invalid { key: &'static str, value: String, reason: String },

  #[error("worker count must be at least 1")]
  NoWorkers,

  #[error("urgency thresholds must be three ascending day counts, got {0:?}")]
  Thresholds(Vec<i64>),

  #[error("failed to read workers file {path}: {source}")]
  WorkersFile {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse workers file {path}: {source}")]
  WorkersJson {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("duplicate worker id {0}")]
  DuplicateWorker(u32),
}

/// Reasons an ingested order record is kept out of the active set.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
  #[error("missing required field '{0}'")]
  MissingField(&'static str),

  #[error("invalid order code {0:?}")]
  InvalidCode(String),

  #[error("invalid quantity in '{field}': {value}")]
  InvalidQuantity { field: &'static str, value: i64 },

  #[error("invalid residual value: {0}")]
  InvalidValue(f64),

  #[error("invalid date in '{field}': {value:?}")]
  InvalidDate { field: &'static str, value: String },
}

/// Errors surfaced to callers feeding progress into a worker agent.
#[derive(Debug, Error)]
pub enum ProgressError {
  #[error("unknown worker {0}")]
  UnknownWorker(u32),

  #[error("worker {0} is no longer running")]
  WorkerGone(u32),

  #[error("units must be positive")]
  NoUnits,
}
