pub mod downtime;
pub mod engine;
pub mod ledger;
pub mod pipeline;
pub mod records;
pub mod sensor;
pub mod shift;
pub mod snapshot;

// Grouped subsystems
pub mod server; // HTTP API + report export
