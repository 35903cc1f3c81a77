// Rotation policy: turns lease events and a refresh timer into handle swaps

pub mod policy;
pub mod report;
pub mod state;

pub use policy::{Rotation, RotationPolicy};
pub use report::{RefreshTrigger, ReportSink, RotationReport};
pub use state::{Freshness, LeaseTimer, PolicyPhase, RotationState};
