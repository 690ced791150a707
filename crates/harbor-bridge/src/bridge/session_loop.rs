//! Bridge loop: drive one worker from `init` to `done`.
//!
//! The protocol is strictly request/response. While an `exec_request` is being
//! proxied nothing else is read from the worker, so at most one request is
//! ever in flight.

use std::collections::HashSet;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{CodecError, FrameCodec, FrameError};
use super::protocol::{Frame, HostFrame, RawMessage, RequestId, WorkerFrame};
use crate::error::BridgeError;
use crate::sandbox::Sandbox;
use crate::sanitize::sanitize_detailed;

/// Exit code reported for a request that was rejected without running.
pub const INVALID_REQUEST_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    AwaitingInitSent,
    Reading,
    Proxying,
    Done,
    Failed,
}

/// Protocol state machine for a single session.
///
/// Borrows the worker's framed streams; the process itself stays with the
/// caller so it can be shut down whatever the outcome.
pub struct BridgeLoop<'a, R, W> {
    reader: &'a mut FramedRead<R, FrameCodec<WorkerFrame>>,
    writer: &'a mut FramedWrite<W, FrameCodec<HostFrame>>,
    sandbox: &'a dyn Sandbox,
    session_id: String,
    state: BridgeState,
    /// Keys of every request id answered so far.
    answered: HashSet<String>,
    /// Set once the worker's stdin is gone; later sends are skipped.
    stdin_closed: bool,
}

impl<'a, R, W> BridgeLoop<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        reader: &'a mut FramedRead<R, FrameCodec<WorkerFrame>>,
        writer: &'a mut FramedWrite<W, FrameCodec<HostFrame>>,
        sandbox: &'a dyn Sandbox,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            writer,
            sandbox,
            session_id: session_id.into(),
            state: BridgeState::AwaitingInitSent,
            answered: HashSet::new(),
            stdin_closed: false,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Number of exec requests answered so far.
    pub fn exec_count(&self) -> usize {
        self.answered.len()
    }

    /// Send `init`, then serve the worker until it reports `done` or `error`.
    ///
    /// End of stream yields `UnexpectedExit { code: None }`; the caller owns
    /// the process and fills in the exit code.
    pub async fn run(&mut self, init: HostFrame) -> Result<Vec<RawMessage>, BridgeError> {
        let result = self.serve(init).await;
        self.transition(if result.is_ok() {
            BridgeState::Done
        } else {
            BridgeState::Failed
        });
        result
    }

    async fn serve(&mut self, init: HostFrame) -> Result<Vec<RawMessage>, BridgeError> {
        debug_assert!(matches!(init, HostFrame::Init { .. }));
        self.send(init).await?;
        self.transition(BridgeState::Reading);

        loop {
            let frame = match self.reader.next().await {
                None => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        "Worker closed stdout without a terminal frame"
                    );
                    return Err(BridgeError::UnexpectedExit { code: None });
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Err(FrameError::InvalidRequest { kind, id, reason }))) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        request_id = %id,
                        %kind,
                        %reason,
                        "Rejecting invalid request"
                    );
                    self.reject(id, &kind, &reason).await?;
                    continue;
                }
                Some(Ok(Err(frame_error))) => {
                    let err = BridgeError::from(frame_error);
                    tracing::warn!(session_id = %self.session_id, error = %err, "Skipping frame");
                    continue;
                }
                Some(Ok(Ok(frame))) => frame,
            };

            tracing::trace!(
                session_id = %self.session_id,
                kind = %frame.kind(),
                "Frame received"
            );

            match frame {
                WorkerFrame::ExecRequest { id, command } => {
                    self.transition(BridgeState::Proxying);
                    self.proxy(id, command).await?;
                    self.transition(BridgeState::Reading);
                }
                WorkerFrame::Done { messages } => {
                    tracing::info!(
                        session_id = %self.session_id,
                        messages = messages.len(),
                        exec_requests = self.answered.len(),
                        "Worker finished"
                    );
                    return Ok(messages);
                }
                WorkerFrame::Error { message, stack } => {
                    tracing::error!(
                        session_id = %self.session_id,
                        error = %message,
                        "Worker reported error"
                    );
                    return Err(BridgeError::WorkerReportedError { message, stack });
                }
            }
        }
    }

    async fn proxy(&mut self, id: RequestId, command: String) -> Result<(), BridgeError> {
        tracing::debug!(session_id = %self.session_id, request_id = %id, %command, "Proxying exec");

        let output = self
            .sandbox
            .exec(&command)
            .await
            .map_err(|source| BridgeError::ProxyFailure {
                command: command.clone(),
                source,
            })?;

        let sanitized = sanitize_detailed(&output.stdout, &output.stderr);
        if !sanitized.removed.is_empty() {
            tracing::debug!(
                request_id = %id,
                removed = ?sanitized.removed,
                "Stripped shell noise from output"
            );
        }

        tracing::debug!(
            session_id = %self.session_id,
            request_id = %id,
            exit_code = output.exit_code,
            output_len = sanitized.output.len(),
            "Exec complete"
        );

        self.respond(id, sanitized.output, output.exit_code).await
    }

    /// Answer a request whose fields could not be read, so the worker is
    /// never left waiting on it.
    async fn reject(
        &mut self,
        id: RequestId,
        kind: &str,
        reason: &str,
    ) -> Result<(), BridgeError> {
        let output = format!("stderr: invalid {kind}: {reason}");
        self.respond(id, output, INVALID_REQUEST_EXIT_CODE).await
    }

    async fn respond(
        &mut self,
        id: RequestId,
        output: String,
        exit_code: i32,
    ) -> Result<(), BridgeError> {
        if !self.answered.insert(id.key()) {
            tracing::warn!(
                session_id = %self.session_id,
                request_id = %id,
                "Duplicate exec request id"
            );
        }

        self.send(HostFrame::ExecResponse {
            id,
            output,
            exit_code,
        })
        .await
    }

    /// Write one frame and flush it.
    ///
    /// A broken pipe means the worker is gone. That is not reported here: the
    /// next read hits end of stream and the exit code gets surfaced instead.
    async fn send(&mut self, frame: HostFrame) -> Result<(), BridgeError> {
        if self.stdin_closed {
            tracing::debug!(kind = frame.kind(), "Worker stdin closed, dropping frame");
            return Ok(());
        }
        match self.writer.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_broken_pipe() => {
                tracing::warn!(session_id = %self.session_id, "Worker stdin closed");
                self.stdin_closed = true;
                Ok(())
            }
            Err(CodecError::Io(e)) => Err(BridgeError::Io(e)),
            Err(e) => Err(BridgeError::Protocol(format!("failed to send frame: {e}"))),
        }
    }

    fn transition(&mut self, next: BridgeState) {
        tracing::trace!(from = ?self.state, to = ?next, "Bridge state");
        self.state = next;
    }
}
