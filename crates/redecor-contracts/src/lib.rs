//! File contracts shared by the redecor engine and CLI: the run event log, the run
//! summary, and the stage checkpoint manifest.

pub mod events;
pub mod runs;
