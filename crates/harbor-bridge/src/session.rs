//! One session: prompt, spawn, bridge, reconstruct, persist, tear down.

use std::path::PathBuf;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{HostFrame, RawMessage, Role};
use crate::bridge::session_loop::BridgeLoop;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::lookup::ExampleLookup;
use crate::runner;
use crate::sandbox::Sandbox;
use crate::supervisor::{ShutdownReport, WorkerCommand, WorkerProcess};
use crate::system_prompt::format_system_prompt;
use crate::telemetry::{SpanMetadata, TraceContext, TraceSink};
use crate::trajectory::{SessionMeta, Trajectory, reconstruct, write_trajectory};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub instruction: String,
    pub session_id: String,
}

impl SessionRequest {
    /// Request with a fresh random session id.
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub trajectory: Trajectory,
    pub trajectory_path: PathBuf,
    pub exec_requests: usize,
    pub shutdown: ShutdownReport,
}

/// Runs sessions against one sandbox. Holds no per-session state.
pub struct SessionRunner<'a> {
    config: &'a BridgeConfig,
    sandbox: &'a dyn Sandbox,
    sink: &'a dyn TraceSink,
    lookup: &'a ExampleLookup,
    worker: Option<WorkerCommand>,
}

impl<'a> SessionRunner<'a> {
    pub fn new(
        config: &'a BridgeConfig,
        sandbox: &'a dyn Sandbox,
        sink: &'a dyn TraceSink,
        lookup: &'a ExampleLookup,
    ) -> Self {
        Self {
            config,
            sandbox,
            sink,
            lookup,
            worker: None,
        }
    }

    /// Use `command` instead of discovering the runner script.
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker = Some(command);
        self
    }

    /// Run one session to completion.
    ///
    /// The worker is shut down on every path, including cancellation, before
    /// this returns. A cancelled session leaves any in-flight exec unanswered.
    pub async fn run(
        &self,
        request: &SessionRequest,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, BridgeError> {
        let session_id = request.session_id.as_str();
        tracing::info!(
            session_id,
            model = %self.config.model,
            bridge_version = crate::BRIDGE_VERSION,
            "Starting session"
        );

        let system_prompt = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(session_id, "Session cancelled before spawn");
                return Err(BridgeError::Cancelled);
            }
            prompt = format_system_prompt(self.sandbox) => {
                prompt.map_err(|source| BridgeError::ProxyFailure {
                    command: "system prompt probe".to_string(),
                    source,
                })?
            }
        };

        let command = match &self.worker {
            Some(command) => command.clone(),
            None => runner::worker_command(self.config)?,
        };
        let mut worker = WorkerProcess::spawn(&command, &self.config.supervisor())?;

        let span = self.start_span(request);
        let init = HostFrame::Init {
            instruction: request.instruction.clone(),
            session_id: request.session_id.clone(),
            model: self.config.model.clone(),
            system_prompt,
            trace_headers: span.as_ref().and_then(TraceContext::to_headers),
        };

        let (result, exec_requests) = match worker.streams() {
            Some((reader, writer)) => {
                let mut bridge = BridgeLoop::new(reader, writer, self.sandbox, session_id);
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::warn!(session_id, "Session cancelled");
                        Err(BridgeError::Cancelled)
                    }
                    r = bridge.run(init) => r,
                };
                (result, bridge.exec_count())
            }
            None => (
                Err(BridgeError::Protocol("worker stdin already closed".to_string())),
                0,
            ),
        };

        let result = match result {
            Err(BridgeError::UnexpectedExit { code: None }) => {
                let code = worker.wait_exit(self.config.shutdown_grace).await;
                Err(BridgeError::UnexpectedExit { code })
            }
            other => other,
        };

        let shutdown = worker.shutdown(self.config.shutdown_grace).await;

        let result = match result {
            Err(BridgeError::UnexpectedExit { code: None }) => Err(BridgeError::UnexpectedExit {
                code: shutdown.exit_code,
            }),
            other => other,
        };

        if let Some(ctx) = &span {
            self.sink.end(ctx, &span_outputs(&result));
        }

        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(session_id, error = %e, "Session failed");
                return Err(e);
            }
        };

        let meta = SessionMeta::new(session_id, self.config.model.clone());
        let trajectory = reconstruct(&messages, &request.instruction, &meta);
        let trajectory_path = write_trajectory(&trajectory, &self.config.logs_dir).await?;

        tracing::info!(
            session_id,
            steps = trajectory.steps.len(),
            exec_requests,
            "Session complete"
        );

        Ok(SessionOutcome {
            trajectory,
            trajectory_path,
            exec_requests,
            shutdown,
        })
    }

    /// Open the session span when an experiment is configured.
    fn start_span(&self, request: &SessionRequest) -> Option<TraceContext> {
        let project = self.config.experiment.as_deref()?;
        let metadata = SpanMetadata::for_session(
            &request.session_id,
            &request.instruction,
            &self.config.model,
            project,
            self.lookup.get(&request.instruction).map(str::to_string),
            &self.config.trial_config,
        );
        Some(self.sink.start(&metadata))
    }
}

/// Convenience wrapper around [`SessionRunner`] with runner discovery.
pub async fn run_session(
    config: &BridgeConfig,
    request: &SessionRequest,
    sandbox: &dyn Sandbox,
    sink: &dyn TraceSink,
    lookup: &ExampleLookup,
    cancel: CancellationToken,
) -> Result<SessionOutcome, BridgeError> {
    SessionRunner::new(config, sandbox, sink, lookup)
        .run(request, cancel)
        .await
}

fn span_outputs(result: &Result<Vec<RawMessage>, BridgeError>) -> Value {
    match result {
        Ok(messages) => {
            let last = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Ai)
                .map(RawMessage::text)
                .unwrap_or_default();
            json!({ "last_message": last })
        }
        Err(e) => json!({ "error": e.to_string() }),
    }
}
