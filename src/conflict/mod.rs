//! Scheduling conflict detection
//!
//! Given a candidate task, the engine inspects every assigned member's other
//! commitments over the candidate's work period and reports overlaps,
//! holiday and training collisions, and per-day overload. Sourcing is
//! hybrid: the hot calendar range in the cache when it is populated, a
//! high-priority upstream range query otherwise.

pub mod engine;

pub use engine::{ConflictEngine, ConflictStore, DetectionOutcome, TaskCandidate};
