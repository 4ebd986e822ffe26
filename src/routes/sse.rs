use std::convert::Infallible;

use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use warp::Filter;

use super::{with_snapshots, Snapshots};

/// Streams every settled snapshot, starting with the current one.
pub fn sse_route(snapshots: Snapshots) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_snapshots(snapshots))
    .and_then(handle_sse)
}

async fn handle_sse(snapshots: Snapshots) -> Result<impl warp::Reply, Infallible> {
  let stream = WatchStream::new(snapshots).map(|snapshot| {
    warp::sse::Event::default()
      .event("snapshot")
      .id(snapshot.cycle.to_string())
      .json_data(&*snapshot)
  });
  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
