use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::test::request;

use shopfloor::config::{Config, WorkerDef};
use shopfloor::events::{FeedEvent, OrderCreated, Stamp};
use shopfloor::ingest::OrderRecord;
use shopfloor::planner::{spawn_agents, Agents};
use shopfloor::routes::routes;

fn agents() -> Agents {
  let config = Config {
    workers: vec![
      WorkerDef { id: 1, name: "Lathe".into(), hours_per_day: 6.0 },
      WorkerDef { id: 2, name: "Mill".into(), hours_per_day: 4.0 },
    ],
    horizon_days: 1,
    ..Config::default()
  };
  spawn_agents(&config, Arc::new(|| NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()))
}

fn order(code: &str, qty: i64) -> FeedEvent {
  FeedEvent::OrderCreated(OrderCreated {
    stamp: Stamp(1),
    record: OrderRecord {
      code: Some(code.into()),
      description: Some("Housing".into()),
      ordered_qty: Some(qty),
      qty_to_deliver: Some(qty),
      residual_value: Some(50.0),
      cycle_time: None,
      manual_priority: None,
      doc_number: Some("D-9".into()),
      doc_date: Some("2024-05-20".into()),
      due_date: Some("2024-06-02".into()),
    },
  })
}

async fn settle(agents: &Agents) {
  let mut rx = agents.planner.subscribe();
  tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.cycle >= 1))
    .await
    .expect("planner did not settle")
    .expect("planner stopped");
}

fn body(bytes: &[u8]) -> Value {
  serde_json::from_slice(bytes).unwrap()
}

#[tokio::test]
async fn workers_are_listed_before_any_cycle() {
  let agents = agents();
  let api = routes(agents.planner.clone(), agents.workers.clone());

  let response = request().method("GET").path("/workers").reply(&api).await;
  assert_eq!(response.status(), StatusCode::OK);
  let workers = body(response.body());
  assert_eq!(workers.as_array().unwrap().len(), 2);
  assert_eq!(workers[0]["name"], "Lathe");
  assert_eq!(workers[0]["capacity_hours"], 6.0);
  assert_eq!(workers[1]["available_hours"], 4.0);
}

#[tokio::test]
async fn settled_schedule_is_served() {
  let agents = agents();
  agents.planner.feed(order("ORD-1", 3)).await.unwrap();
  settle(&agents).await;
  let api = routes(agents.planner.clone(), agents.workers.clone());

  let response = request().method("GET").path("/priorities").reply(&api).await;
  assert_eq!(response.status(), StatusCode::OK);
  let priorities = body(response.body());
  assert_eq!(priorities[0]["code"], "ORD-1");
  assert_eq!(priorities[0]["priority"], 3);
  assert_eq!(priorities[0]["remaining_hours"], 3.0);

  let response = request().method("GET").path("/allocations").reply(&api).await;
  let allocations = body(response.body());
  assert_eq!(allocations["active"][0]["worker_id"], 1);
  assert_eq!(allocations["active"][0]["hours"], 3.0);
  assert_eq!(allocations["active"][0]["state"], "awarded");
  assert!(allocations["recent"].as_array().unwrap().is_empty());

  let response = request().method("GET").path("/snapshot").reply(&api).await;
  let snapshot = body(response.body());
  assert_eq!(snapshot["cycle"], 1);
  assert_eq!(snapshot["orders"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn progress_reports_reach_the_worker() {
  let agents = agents();
  agents.planner.feed(order("ORD-1", 3)).await.unwrap();
  settle(&agents).await;
  let api = routes(agents.planner.clone(), agents.workers.clone());

  let response = request()
    .method("POST")
    .path("/progress")
    .json(&json!({"order_code": "ORD-1", "worker_id": 1, "units": 1}))
    .reply(&api)
    .await;
  assert_eq!(response.status(), StatusCode::ACCEPTED);
  let update = body(response.body());
  assert_eq!(update["worker_id"], 1);
  assert_eq!(update["units"], 1);

  let status = agents.workers[0].status().await.unwrap();
  assert_eq!(status.allocations[0].worked_hours, 1.0);
}

#[tokio::test]
async fn bad_progress_reports_are_refused() {
  let agents = agents();
  let api = routes(agents.planner.clone(), agents.workers.clone());

  let unknown = request()
    .method("POST")
    .path("/progress")
    .json(&json!({"order_code": "ORD-1", "worker_id": 9, "units": 1}))
    .reply(&api)
    .await;
  assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
  assert_eq!(body(unknown.body())["error"], "unknown worker 9");

  let malformed = request()
    .method("POST")
    .path("/progress")
    .header("content-type", "application/json")
    .body(r#"{"order_code": "ORD-1", "units": "many"}"#)
    .reply(&api)
    .await;
  assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

  let zero = request()
    .method("POST")
    .path("/progress")
    .json(&json!({"order_code": "ORD-1", "worker_id": 1, "units": 0}))
    .reply(&api)
    .await;
  assert_eq!(zero.status(), StatusCode::BAD_REQUEST);

  let blank = request()
    .method("POST")
    .path("/progress")
    .json(&json!({"order_code": "  ", "worker_id": 1, "units": 2}))
    .reply(&api)
    .await;
  assert_eq!(blank.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
  let agents = agents();
  let api = routes(agents.planner.clone(), agents.workers.clone());
  let response = request().method("GET").path("/tasks").reply(&api).await;
  assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
