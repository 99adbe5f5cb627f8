//! Hydrological flow routing over out-of-core rasters
//!
//! - Flow direction: D8 steepest descent, sources and confluences
//! - Flow accumulation: upstream cell counts, merged at confluences
//! - Engine: runs both phases over tile-cached bands with a worker pool

mod control;
mod engine;
pub(crate) mod flow_accumulation;
pub(crate) mod flow_direction;
mod progress;
pub mod sources;

pub use control::RunControl;
pub use engine::{flow_routing, FlowBands, FlowParams, FlowRouting, FlowSummary, PhaseSettings};
pub use flow_accumulation::{flow_accumulation, AccumulationOutput};
pub use flow_direction::{flow_direction, inbound, steepest_descent, DirectionOutput, Inbound, BOUNDARY_DROP};
pub use progress::{Phase, Progress};
pub use sources::{Chunk, SourceFile, SourceWriter};
