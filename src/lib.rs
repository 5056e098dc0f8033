pub mod classifier;
pub mod command;
pub mod config;
pub mod discovery;
pub mod entity;
pub mod error;
pub mod graph;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod persist;
pub mod report;
pub mod severity;
pub mod snapshot;
