use serde_json::json;
use warp::Filter;

use super::{with_snapshots, Snapshots};

/// Read-only views of the last settled snapshot.
pub fn snapshot_routes(snapshots: Snapshots) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let priorities = warp::path("priorities")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_snapshots(snapshots.clone()))
    .map(|snapshots: Snapshots| {
      let snapshot = snapshots.borrow().clone();
      warp::reply::json(&snapshot.orders)
    });

  let allocations = warp::path("allocations")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_snapshots(snapshots.clone()))
    .map(|snapshots: Snapshots| {
      let snapshot = snapshots.borrow().clone();
      warp::reply::json(&json!({
        "cycle": snapshot.cycle,
        "active": snapshot.allocations,
        "recent": snapshot.recent,
      }))
    });

  let workers = warp::path("workers")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_snapshots(snapshots.clone()))
    .map(|snapshots: Snapshots| {
      let snapshot = snapshots.borrow().clone();
      warp::reply::json(&snapshot.workers)
    });

  let full = warp::path("snapshot")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_snapshots(snapshots))
    .map(|snapshots: Snapshots| {
      let snapshot = snapshots.borrow().clone();
      warp::reply::json(&*snapshot)
    });

  priorities.or(allocations).or(workers).or(full)
}
