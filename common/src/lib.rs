// Shared library for the AI Factory orchestrator: job lifecycle, readiness and measurements

pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod measurement;
pub mod models;
pub mod orchestrator;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod results;
pub mod telemetry;
