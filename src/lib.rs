//! quorumfx: a multi-strategy consensus trading engine.
//!
//! Independent strategies vote on each symbol; a weighted winner-take-all
//! aggregator picks a direction; a policy gate vetoes; an adaptive weight
//! store learns from settled outcomes; a position supervisor manages every
//! open trade on its own clock.

pub mod allocation;
pub mod config;
pub mod consensus;
pub mod correlation;
pub mod engine;
pub mod execution;
pub mod gate;
pub mod heartbeat;
pub mod logging;
pub mod regime;
pub mod signal;
pub mod state;
pub mod storage;
pub mod strategies;
pub mod supervisor;
pub mod weights;
