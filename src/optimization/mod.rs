//! Optimization loop: checkpointing, parameter history, phase machine, the
//! per-iteration orchestrator, and the external modifier wire contract
//! (spec.md §4.8-§4.11, C8-C11).

pub mod checkpoint;
pub mod history;
pub mod modifier;
pub mod orchestrator;
pub mod phase;

pub use checkpoint::CheckpointStore;
pub use history::HistoryStore;
pub use orchestrator::Orchestrator;
pub use phase::{Event, Phase, PhaseMachine};
