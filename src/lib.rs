pub mod api;
pub mod errors;
pub mod executor;
pub mod live;
pub mod relay_config;
pub mod supervisor;
pub mod telemetry;
pub mod watcher;
