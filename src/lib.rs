pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod job_queue;
pub mod routes;
pub mod telemetry;
pub mod webhooks;
