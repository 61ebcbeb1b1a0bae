//! Core logic of the assistant: the conversation store, the model gateway,
//! tool dispatch and the loop that ties them together.
//!
//! A user message enters through [`Orchestrator::handle_turn`], which keeps
//! asking the model and running the tools it requests until the model
//! answers.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

pub mod conversation;
pub mod gateway;
mod orchestrator;
pub mod store;
pub mod tool;

pub use orchestrator::{
    AgentConfig, DEFAULT_MODEL, InboundMessage, Orchestrator, OrchestratorBuilder,
    OrchestratorEvent, TurnError,
};
pub use tokio_util::sync::CancellationToken;
