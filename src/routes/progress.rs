use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::Filter;

use super::error_reply;
use crate::error::ProgressError;
use crate::worker_agent::WorkerHandle;

type Workers = Arc<BTreeMap<u32, WorkerHandle>>;

/// Units produced on the shop floor, reported against one worker.
#[derive(Debug, Deserialize)]
pub struct ProgressReport {
  pub order_code: String,
  pub worker_id: u32,
  pub units: u32,
}

pub fn progress_route(workers: Vec<WorkerHandle>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let workers: Workers = Arc::new(workers.into_iter().map(|w| (w.id, w)).collect());
  warp::path("progress")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::content_length_limit(16 * 1024))
    .and(warp::body::json())
    .and(with_workers(workers))
    .and_then(handle_progress)
}

fn with_workers(workers: Workers) -> impl Filter<Extract = (Workers,), Error = Infallible> + Clone {
  warp::any().map(move || workers.clone())
}

async fn handle_progress(report: ProgressReport, workers: Workers) -> Result<impl warp::Reply, Infallible> {
  let code = report.order_code.trim();
  if code.is_empty() {
    return Ok(error_reply(StatusCode::BAD_REQUEST, "order_code must not be empty"));
  }
  let Some(worker) = workers.get(&report.worker_id) else {
    warn!(worker = report.worker_id, order = code, "progress for unknown worker");
    return Ok(error_reply(StatusCode::NOT_FOUND, ProgressError::UnknownWorker(report.worker_id)));
  };

  match worker.report_progress(code, report.units).await {
    Ok(update) => {
      info!(worker = update.worker_id, order = %update.order_code, units = update.units, "progress reported");
      Ok(warp::reply::with_status(warp::reply::json(&update), StatusCode::ACCEPTED))
    }
    Err(e @ ProgressError::NoUnits) => Ok(error_reply(StatusCode::BAD_REQUEST, e)),
    Err(e) => {
      error!(worker = report.worker_id, order = code, error = %e, "progress not delivered");
      Ok(error_reply(StatusCode::SERVICE_UNAVAILABLE, e))
    }
  }
}
