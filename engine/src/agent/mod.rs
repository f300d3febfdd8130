//! Agent orchestration
//!
//! A bounded, model-guided loop that answers a query by delegating to the
//! forecasting, document-retrieval and structured-data capabilities. The
//! orchestrator decides one step at a time; the core drives the loop, runs
//! the delegations and keeps the session.

pub mod core;
pub mod decision;
pub mod orchestrator;
pub mod session;

pub use core::{AgentCore, QueryResponse};
pub use decision::{Decision, DecisionError, RawDecision};
pub use orchestrator::{Orchestrator, StepOutcome};
pub use session::{Session, SessionStore, WorkMap};
