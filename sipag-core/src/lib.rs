//! `sipag-core`: the worker lifecycle engine for a parallel development
//! orchestrator (§2).
//!
//! Leaf-first module map, mirroring §2's component table:
//! - [`decoder`] — Stream Decoder (§4.1).
//! - [`process`] — Worker Process (§4.2).
//! - [`store`] — State Store (§4.3).
//! - [`state_machine`] — State Machine (§4.4).
//! - [`forge`] — Forge Client (§4.5).
//! - [`scheduler`] — Scheduler (§4.6).
//! - [`control`] — Control API (§4.7).
//! - [`worker::model`] — the data model (§3) shared by all of the above.
//! - [`config`] — runtime configuration (§6).
//! - [`error`] — the caller-matched error taxonomy (§7).

pub mod config;
pub mod control;
pub mod decoder;
pub mod error;
pub mod forge;
pub mod process;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod worker;

pub use error::OrchestratorError;
