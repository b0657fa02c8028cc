pub mod config;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod sqlite;
pub mod telemetry;
pub mod trigger;
