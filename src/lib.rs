//! # taskmon
//!
//! Distributed task execution with a lifecycle event stream.
//!
//! Producers put task messages on a queue (pgmq), workers execute them with
//! late acknowledgement and retry policies, and every step is published as a
//! lifecycle event. The monitor folds that event stream into per-task records
//! and reports each state change, tolerating duplicated and reordered events.

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod monitor;
pub mod telemetry;
pub mod worker;
