pub mod admission;
pub mod clock;
pub mod config;
pub mod idempotency;
pub mod lease;
pub mod limits;
pub mod model;
pub mod observability;
pub mod overlap;
pub mod reaper;
pub mod store;
pub mod wal;
