//! Solar pond monitor.
//!
//! Samples the inverter, weather feed and pond devices on a fixed cadence, derives
//! time-aligned feature records, persists each record to SQLite, CSV and JSONL, and
//! feeds the latest record to a hybrid heuristic/model controller.

pub mod collector;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod features;
pub mod ml;
pub mod sinks;
pub mod sources;
pub mod telemetry;
