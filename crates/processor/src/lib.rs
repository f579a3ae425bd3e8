//! xpdiff processor: turns input XRs into predicted diffs.
//!
//! For each XR the processor finds its composition, resolves the extra resources
//! the pipeline needs, renders (possibly more than once), validates the result,
//! and diffs every rendered resource against the cluster.

#![forbid(unsafe_code)]

pub mod calculator;
pub mod discovery;
pub mod processor;
pub mod render;
pub mod requirements;
pub mod resource_manager;

pub use calculator::DiffCalculator;
pub use processor::{BatchError, DiffProcessor, ProcessorConfig};
pub use render::{CrossplaneRenderer, RenderInput, RenderOutput, Renderer};
pub use requirements::RequirementsProvider;
pub use resource_manager::{ensure_uid, update_owner_refs, ResourceManager};
