//! Per-turn conversational pipeline.
//!
//! [`text`] owns utterance accumulation, speech cleanup, and synthesis
//! chunking; [`heartbeat`] keeps the duplex channel alive during slow
//! stages; [`controller`] orchestrates one turn end to end.

pub mod controller;
pub mod heartbeat;
pub mod text;

pub use controller::{PipelineController, TurnOutcome};
