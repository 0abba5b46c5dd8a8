//! Planforge checkpoint persistence.
//!
//! Implements [`pipeline::CheckpointStore`] twice: [`FsCheckpointStore`] for
//! real runs and [`MemoryCheckpointStore`] for tests and dry runs.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** File layout, envelope format and atomic writes live
//! here; the orchestrator sees only the port.

mod envelope;
mod fs;
mod memory;

pub use envelope::SCHEMA_VERSION;
pub use fs::FsCheckpointStore;
pub use memory::MemoryCheckpointStore;
