//! Orchestration step
//!
//! One call to [`Orchestrator::step`] asks the reasoning engine what to do
//! next given the conversation and the work collected so far, and either
//! finishes the query or records exactly one pending delegation for the
//! driver to dispatch. The step counter bounds the loop: once it reaches
//! `max_steps` the step finishes with a notice without calling the engine.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capabilities::Delegation;
use crate::llm::router::LLMRouter;
use crate::llm::Message;

use super::decision::Decision;
use super::session::Session;

/// Answer given when the reasoning engine cannot be reached
pub const DEGRADED_ANSWER: &str =
    "I couldn't reach the reasoning service to finish this request. Please try again shortly.";

/// Capability description and output contract given to the reasoning engine
pub const PREAMBLE: &str = r#"You are an orchestrator agent that plans step-by-step to answer user queries.

You have access to THREE specialized capabilities:

1. Forecasting (DELEGATE_FORECAST):
   - Use for future predictions and forecasts
   - Example: "Forecast ticket counts for the next 3 days"
   - Example: "Predict tickets from 2026-02-15 for 5 days"
   - Requires: forecasting_payload with:
     - horizon_days (required): number of days to forecast, 1 to 365
     - start_date (optional): start date in YYYY-MM-DD format. Defaults to today if not specified.

2. Document retrieval (DELEGATE_RETRIEVAL):
   - Use for knowledge questions, definitions, explanations
   - Example: "What does NET_500 mean?", "How do I reset a password?"
   - Requires: rag_query as a string

3. Structured data (DELEGATE_STRUCTURED):
   - Use for historical data, statistics, ticket counts from the database
   - Example: "Get ticket count from today till 2 days", "How many tickets last week?"
   - Requires: db_query as a string

Use state.work to see what you already collected from previous capability calls.
Stop when you have enough information and return FINISH with final_answer.
Max 5 steps to prevent infinite loops.

Respond with a single JSON object and nothing else:
{"action": "FINISH" | "DELEGATE_FORECAST" | "DELEGATE_RETRIEVAL" | "DELEGATE_STRUCTURED",
 "reasoning": "<why this action>",
 "final_answer": "<answer, only for FINISH>",
 "forecasting_payload": {"horizon_days": <int>, "start_date": "<YYYY-MM-DD>"},
 "rag_query": "<question for retrieval>",
 "db_query": "<question for structured data>"}
Omit the fields that do not apply to the chosen action."#;

/// What the driver should do after a step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The query is answered
    Finished(String),
    /// Dispatch this delegation, record its result, then step again
    Delegate(Delegation),
}

pub struct Orchestrator {
    router: Arc<LLMRouter>,
    max_steps: u32,
}

impl Orchestrator {
    pub fn new(router: Arc<LLMRouter>, max_steps: u32) -> Self {
        Self { router, max_steps }
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn step_limit_notice(&self) -> String {
        format!("Stopped after {} steps to avoid looping.", self.max_steps)
    }

    /// Decide the next action for `session` and apply it to the session
    pub async fn step(&self, session: &mut Session) -> StepOutcome {
        if session.steps >= self.max_steps {
            warn!(
                "Session {} reached the step limit ({})",
                session.id, self.max_steps
            );
            let notice = self.step_limit_notice();
            session.messages.push(Message::assistant(&notice));
            return StepOutcome::Finished(notice);
        }

        let work_json = serde_json::to_string_pretty(&session.work.snapshot())
            .unwrap_or_else(|_| "{}".to_string());
        debug!(
            "Orchestrator | steps={} | messages={} | work={}",
            session.steps,
            session.messages.len(),
            work_json
        );

        let mut input = Vec::with_capacity(session.messages.len() + 2);
        input.push(Message::system(PREAMBLE));
        input.extend(session.messages.iter().cloned());
        input.push(Message::system(format!(
            "Current state.work JSON:\n{}",
            work_json
        )));

        let start = Instant::now();
        let decision = match self.router.call(&input).await {
            Ok((completion, provider)) => {
                info!(
                    provider = %provider,
                    latency_ms = start.elapsed().as_millis() as u64,
                    input_tokens = completion.usage.input_tokens,
                    output_tokens = completion.usage.output_tokens,
                    "Orchestrator decision received"
                );
                match Decision::parse(&completion.content) {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!("Unusable decision from {}: {}", provider, e);
                        Decision::fallback(session.last_user_message())
                    }
                }
            }
            Err(e) => {
                error!("Reasoning engine unavailable: {}", e);
                session.steps += 1;
                session.messages.push(Message::assistant(DEGRADED_ANSWER));
                return StepOutcome::Finished(DEGRADED_ANSWER.to_string());
            }
        };

        info!(
            "action={} | reasoning={}",
            decision.action_name(),
            decision.reasoning()
        );
        session.messages.push(Message::assistant(decision_record(&decision)));
        session.steps += 1;

        match decision {
            Decision::Finish { answer, .. } => {
                session.messages.push(Message::assistant(&answer));
                StepOutcome::Finished(answer)
            }
            Decision::Delegate { delegation, .. } => {
                if let Some(previous) = session.work.set_pending(delegation.clone()) {
                    warn!(
                        "Replacing undispatched {} delegation",
                        previous.capability()
                    );
                }
                StepOutcome::Delegate(delegation)
            }
        }
    }
}

/// Assistant message recording a decision in the history
fn decision_record(decision: &Decision) -> String {
    let payload = match decision {
        Decision::Finish { .. } => "none".to_string(),
        Decision::Delegate { delegation, .. } => delegation.describe(),
    };
    format!(
        "Orchestrator decision:\naction={}\nreasoning={}\npayload={}",
        decision.action_name(),
        decision.reasoning(),
        payload
    )
}
