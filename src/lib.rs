pub mod bootstrap;
pub mod config;
pub mod dead_letter;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod retry_policy;
pub mod routes;
pub mod status_reporter;
pub mod worker_loop;
pub mod worker_processing;
