// Deadline alert engine: milestone evaluation, dispatch ledger, and alert delivery

pub mod bootstrap;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod evaluator;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod notify;
pub mod policy;
pub mod resolver;
pub mod scheduler;
pub mod telemetry;
