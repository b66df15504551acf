pub mod ai;
pub mod bootstrap;
pub mod catalog;
pub mod chat;
pub mod config;
pub mod db;
pub mod keyword_store;
pub mod lead_scoring;
pub mod models;
pub mod qdrant_store;
pub mod readiness;
pub mod retrieval;
pub mod server;
pub mod telemetry;

pub use config::AppConfig;
pub use server::run_server;
