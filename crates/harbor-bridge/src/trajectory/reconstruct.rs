//! Fold a worker's flat message history into trajectory steps.
//!
//! The only ordering signal is position in the history. An `ai` message opens
//! a step; if it carries tool calls, the step stays pending and collects the
//! `tool` messages that answer those calls until the next `ai` message.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use super::types::{
    Agent, FinalMetrics, Observation, ObservationResult, SCHEMA_VERSION, Step, StepSource,
    ToolCall, Trajectory,
};
use crate::bridge::protocol::{RawMessage, Role};

/// Name recorded in the trajectory's agent descriptor.
pub const AGENT_NAME: &str = "deepagent-js-harbor";

/// Version recorded next to [`AGENT_NAME`]; tracks the agent, not this crate.
pub const AGENT_VERSION: &str = "0.0.1";

/// Everything about the session the history itself doesn't carry.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMeta {
    pub session_id: String,
    pub agent_name: String,
    pub agent_version: String,
    pub model_name: String,
    pub extra: IndexMap<String, Value>,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        let extra = IndexMap::from([
            ("framework".to_string(), Value::from("deepagents-js")),
            ("runtime".to_string(), Value::from("node")),
        ]);
        Self {
            session_id: session_id.into(),
            agent_name: AGENT_NAME.to_string(),
            agent_version: AGENT_VERSION.to_string(),
            model_name: model_name.into(),
            extra,
        }
    }
}

/// Agent step still waiting for the results of its tool calls.
struct PendingStep {
    step: Step,
    results: Vec<ObservationResult>,
}

impl PendingStep {
    /// Whether `call_id` names one of this step's calls that has no result yet.
    fn awaits(&self, call_id: &str) -> bool {
        self.step.tool_calls().iter().any(|c| c.tool_call_id == call_id)
            && !self.results.iter().any(|r| r.source_call_id == call_id)
    }

    fn finish(self) -> Step {
        let mut step = self.step;
        if !self.results.is_empty() {
            step.observation = Some(Observation {
                results: self.results,
            });
        }
        step
    }
}

/// Build the trajectory, timestamping steps with the wall clock.
pub fn reconstruct(messages: &[RawMessage], instruction: &str, meta: &SessionMeta) -> Trajectory {
    reconstruct_with_clock(messages, instruction, meta, Utc::now)
}

/// Build the trajectory, timestamping steps with `clock`.
pub fn reconstruct_with_clock(
    messages: &[RawMessage],
    instruction: &str,
    meta: &SessionMeta,
    mut clock: impl FnMut() -> DateTime<Utc>,
) -> Trajectory {
    let mut steps = vec![Step {
        step_id: 1,
        timestamp: clock(),
        source: StepSource::User,
        message: instruction.to_string(),
        tool_calls: None,
        observation: None,
    }];
    let mut pending: Option<PendingStep> = None;
    let mut prompt_tokens: u64 = 0;
    let mut completion_tokens: u64 = 0;

    for (index, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Ai => {
                if let Some(usage) = msg.usage {
                    prompt_tokens = prompt_tokens.saturating_add(usage.input_tokens);
                    completion_tokens = completion_tokens.saturating_add(usage.output_tokens);
                }

                if let Some(done) = pending.take() {
                    steps.push(done.finish());
                }

                let tool_calls: Vec<ToolCall> = msg
                    .tool_calls()
                    .iter()
                    .map(|call| ToolCall {
                        tool_call_id: call.id.clone(),
                        function_name: call.name.clone(),
                        arguments: call.args.clone(),
                    })
                    .collect();

                let step = Step {
                    step_id: next_step_id(&steps),
                    timestamp: clock(),
                    source: StepSource::Agent,
                    message: msg.text(),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    observation: None,
                };

                if step.tool_calls.is_some() {
                    pending = Some(PendingStep {
                        step,
                        results: Vec::new(),
                    });
                } else {
                    steps.push(step);
                }
            }
            Role::Tool => {
                let call_id = msg.tool_call_id.clone().unwrap_or_default();
                match pending.as_mut() {
                    Some(p) if p.awaits(&call_id) => p.results.push(ObservationResult {
                        source_call_id: call_id,
                        content: msg.text(),
                    }),
                    Some(p) => tracing::warn!(
                        index,
                        tool_call_id = %call_id,
                        step_id = p.step.step_id,
                        "Dropping tool result that matches no open call of the pending step"
                    ),
                    None => tracing::warn!(
                        index,
                        tool_call_id = %call_id,
                        "Dropping tool result with no pending tool call"
                    ),
                }
            }
            Role::User | Role::Other => {}
        }
    }

    if let Some(done) = pending.take() {
        steps.push(done.finish());
    }

    let final_metrics = FinalMetrics {
        total_prompt_tokens: (prompt_tokens > 0).then_some(prompt_tokens),
        total_completion_tokens: (completion_tokens > 0).then_some(completion_tokens),
        total_steps: steps.len(),
    };

    Trajectory {
        schema_version: SCHEMA_VERSION.to_string(),
        session_id: meta.session_id.clone(),
        agent: Agent {
            name: meta.agent_name.clone(),
            version: meta.agent_version.clone(),
            model_name: meta.model_name.clone(),
            extra: meta.extra.clone(),
        },
        steps,
        final_metrics,
    }
}

fn next_step_id(steps: &[Step]) -> u32 {
    steps.last().map_or(1, |s| s.step_id + 1)
}
