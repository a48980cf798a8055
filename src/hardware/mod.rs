//! Hardware abstraction.
//!
//! - [`capabilities`] - async traits mirroring the stage, camera, stream and codec SDK objects
//! - [`mock`] - simulated rig implementing every trait, with fault injection

pub mod capabilities;
pub mod mock;
