use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::planner::PlannerHandle;
use crate::snapshot::ScheduleSnapshot;
use crate::worker_agent::WorkerHandle;

pub mod progress;
pub mod snapshot;
pub mod sse;

pub type Snapshots = watch::Receiver<Arc<ScheduleSnapshot>>;

pub fn routes(
  planner: PlannerHandle,
  workers: Vec<WorkerHandle>,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  snapshot::snapshot_routes(planner.subscribe())
    .or(sse::sse_route(planner.subscribe()))
    .or(progress::progress_route(workers))
    .recover(handle_rejection)
}

pub(crate) fn with_snapshots(snapshots: Snapshots) -> impl Filter<Extract = (Snapshots,), Error = Infallible> + Clone {
  warp::any().map(move || snapshots.clone())
}

pub(crate) fn error_reply(status: StatusCode, message: impl std::fmt::Display) -> warp::reply::WithStatus<warp::reply::Json> {
  warp::reply::with_status(warp::reply::json(&json!({"error": message.to_string()})), status)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let reply = if err.is_not_found() {
    error_reply(StatusCode::NOT_FOUND, "not found")
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    error_reply(StatusCode::BAD_REQUEST, e)
  } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
    error_reply(StatusCode::BAD_REQUEST, "expected a JSON body")
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    error_reply(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
  } else {
    tracing::error!("unhandled rejection: {:?}", err);
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
  };
  Ok(reply)
}
