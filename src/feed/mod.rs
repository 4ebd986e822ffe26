//! Order producers. Each feed turns an external source into `FeedEvent`s
//! and pushes them into the planner inbox.

pub mod amqp;
pub mod file;
