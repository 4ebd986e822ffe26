pub mod allocation;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod feed;
pub mod ingest;
pub mod messaging;
pub mod models;
pub mod persistence;
pub mod planner;
pub mod priority;
pub mod routes;
pub mod snapshot;
pub mod worker_agent;
