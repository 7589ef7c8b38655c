//! Dual-agent therapeutic workflow orchestration.
//!
//! A supervisor agent gates progression through a fixed stage protocol, a
//! responder agent produces the user-facing reply, and a safety screener
//! can preempt both. `workflow::Orchestrator` ties the pieces together;
//! `backend::ModelBackend` is the seam where real model vendors plug in.

pub mod backend;
pub mod errors;
pub mod memory;
pub mod prompt;
pub mod responder;
pub mod safety;
pub mod session;
pub mod stage;
pub mod supervisor;
pub mod workflow;
