//! # flowtile algorithms
//!
//! The flow engine of flowtile.
//!
//! ## Available Algorithms
//!
//! - **hydrology**: D8 flow direction and flow accumulation over rasters
//!   larger than memory, run phase by phase on a pool of worker threads

pub mod hydrology;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::hydrology::{
        flow_accumulation, flow_direction, flow_routing, FlowBands, FlowParams, FlowRouting,
        FlowSummary, Phase, Progress,
    };
    pub use flowtile_core::prelude::*;
}
