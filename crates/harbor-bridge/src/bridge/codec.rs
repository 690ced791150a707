//! Line-framed codec for worker communication.
//!
//! Splits raw bytes on `\n` with AnyDelimiterCodec + serde_json for serialization.
//! UTF-8 is checked per line so one undecodable line stays a per-line failure.
//! Works over any AsyncRead/AsyncWrite (child pipes, in-memory duplex, etc).
//!
//! A line that fails to parse is handed to the caller as an item, not as a
//! stream error: `FramedRead` stops after the first decoder error, and one bad
//! line must not end the session.

use std::io;
use std::marker::PhantomData;

use serde_json::Value;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::{Frame, RequestId};

/// Upper bound for one line. The terminal `done` frame embeds the whole
/// message history, so this is far above what short-line defaults allow.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Frames above this size are logged when encoded.
const LARGE_FRAME_BYTES: usize = 100_000;

/// How much of an offending line is kept for diagnostics.
const SNIPPET_CHARS: usize = 200;

/// A single line that could not be turned into a frame. Recoverable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame ({reason}): {snippet}")]
    Malformed { reason: String, snippet: String },

    #[error("unknown frame kind `{kind}`")]
    UnknownKind { kind: String },

    /// A frame that awaits a reply, with a usable `id` but bad fields.
    #[error("invalid {kind} `{id}`: {reason}")]
    InvalidRequest {
        kind: String,
        id: RequestId,
        reason: String,
    },
}

impl FrameError {
    fn malformed(reason: impl ToString, line: &str) -> Self {
        Self::Malformed {
            reason: reason.to_string(),
            snippet: line.chars().take(SNIPPET_CHARS).collect(),
        }
    }
}

/// Stream-level failure. Fatal for the session.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
    }
}

/// Serialize a frame as one newline-terminated UTF-8 line.
pub fn encode_frame<T: Frame>(frame: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one line into a frame.
///
/// Blank lines are not frames and yield `Ok(None)`.
pub fn decode_line<T: Frame>(line: &str) -> Result<Option<T>, FrameError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line).map_err(|e| FrameError::malformed(e, line))?;
    if !value.is_object() {
        return Err(FrameError::malformed("not a JSON object", line));
    }

    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) if T::KINDS.contains(&kind) => kind.to_string(),
        Some(kind) => {
            return Err(FrameError::UnknownKind {
                kind: kind.to_string(),
            });
        }
        None => {
            return Err(FrameError::UnknownKind {
                kind: "<missing>".to_string(),
            });
        }
    };

    let reply_id = if T::expects_reply(&kind) {
        value.get("id").cloned()
    } else {
        None
    };

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| match reply_id {
            Some(id) => FrameError::InvalidRequest {
                kind,
                id: RequestId::from(id),
                reason: e.to_string(),
            },
            None => FrameError::malformed(e, line),
        })
}

/// Parse one raw line. Bytes that are not UTF-8 make the line malformed.
fn decode_bytes<T: Frame>(line: &[u8]) -> Result<Option<T>, FrameError> {
    match std::str::from_utf8(line) {
        Ok(text) => decode_line(text),
        Err(e) => Err(FrameError::malformed(e, &String::from_utf8_lossy(line))),
    }
}

/// Codec that frames messages by newline and serializes with JSON.
///
/// Decoded items are `Result<T, FrameError>` so per-line failures reach the caller.
pub struct FrameCodec<T> {
    lines: AnyDelimiterCodec,
    max_frame_bytes: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            lines: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_frame_bytes,
            ),
            max_frame_bytes,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn map_lines_error(&self, e: AnyDelimiterCodecError) -> CodecError {
        match e {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => CodecError::FrameTooLong {
                limit: self.max_frame_bytes,
            },
            AnyDelimiterCodecError::Io(e) => CodecError::Io(e),
        }
    }

    /// Skip blank lines; hand every other line to the caller as one item.
    fn next_item(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Result<T, FrameError>>, CodecError>
    where
        T: Frame,
    {
        loop {
            let decoded: Result<Option<Bytes>, _> = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };
            let Some(line) = decoded.map_err(|e| self.map_lines_error(e))? else {
                return Ok(None);
            };
            match decode_bytes::<T>(&line) {
                Ok(None) => continue,
                Ok(Some(frame)) => return Ok(Some(Ok(frame))),
                Err(e) => return Ok(Some(Err(e))),
            }
        }
    }
}

impl<T: Frame> Decoder for FrameCodec<T> {
    type Item = Result<T, FrameError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_item(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.next_item(src, true)
    }
}

impl<T: Frame> Encoder<T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)?;
        let json_len = json.len();
        tracing::trace!(kind = item.kind(), json_size_bytes = json_len, "Encoding frame");
        if json_len > LARGE_FRAME_BYTES {
            tracing::info!(
                kind = item.kind(),
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.lines
            .encode(json, dst)
            .map_err(|e| self.map_lines_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{HostFrame, RawMessage, RequestId, Role, Usage, WorkerFrame};
    use serde_json::json;

    fn roundtrip<T: Frame + Clone + PartialEq + std::fmt::Debug>(frame: T) {
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        let line = std::str::from_utf8(&bytes).unwrap();
        let decoded = decode_line::<T>(line).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn host_frames_roundtrip() {
        roundtrip(HostFrame::Init {
            instruction: "multi\nline instruction".to_string(),
            session_id: "s".to_string(),
            model: "m".to_string(),
            system_prompt: "p".to_string(),
            trace_headers: None,
        });
        roundtrip(HostFrame::ExecResponse {
            id: RequestId::from(3),
            output: "\nstderr: boom".to_string(),
            exit_code: 1,
        });
    }

    #[test]
    fn worker_frames_roundtrip() {
        roundtrip(WorkerFrame::Error {
            message: "bad".to_string(),
            stack: Some("at main".to_string()),
        });
        roundtrip(WorkerFrame::Done {
            messages: vec![RawMessage {
                role: Role::Ai,
                content: json!("done"),
                tool_calls: None,
                usage: Some(Usage {
                    input_tokens: 1,
                    output_tokens: 2,
                }),
                tool_call_id: None,
            }],
        });
    }

    #[test]
    fn blank_line_is_not_a_frame() {
        assert_eq!(decode_line::<WorkerFrame>("   \t ").unwrap(), None);
        assert_eq!(decode_line::<WorkerFrame>("").unwrap(), None);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = decode_line::<WorkerFrame>("npm WARN deprecated").unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn malformed_snippet_is_truncated() {
        let line = "x".repeat(1000);
        let Err(FrameError::Malformed { snippet, .. }) = decode_line::<WorkerFrame>(&line) else {
            panic!("expected malformed");
        };
        assert_eq!(snippet.len(), SNIPPET_CHARS);
    }

    #[test]
    fn unknown_kind_is_reported_with_its_name() {
        let err = decode_line::<WorkerFrame>(r#"{"type":"progress","pct":50}"#).unwrap_err();
        assert_eq!(
            err,
            FrameError::UnknownKind {
                kind: "progress".to_string()
            }
        );
    }

    #[test]
    fn host_kind_is_unknown_to_worker_direction() {
        let err = decode_line::<WorkerFrame>(r#"{"type":"init"}"#).unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind { .. }));
    }

    #[test]
    fn known_kind_with_missing_fields_is_malformed() {
        let err = decode_line::<WorkerFrame>(r#"{"type":"done","messages":7}"#).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));

        let err = decode_line::<WorkerFrame>(r#"{"type":"exec_request","command":5}"#).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn exec_request_with_id_but_bad_fields_keeps_its_id() {
        let err = decode_line::<WorkerFrame>(r#"{"type":"exec_request","id":"1"}"#).unwrap_err();
        let FrameError::InvalidRequest { kind, id, .. } = err else {
            panic!("expected invalid request, got {err:?}");
        };
        assert_eq!(kind, "exec_request");
        assert_eq!(id, RequestId::from("1"));
    }

    #[test]
    fn codec_skips_blank_lines_and_surfaces_bad_lines() {
        let mut codec = FrameCodec::<WorkerFrame>::new();
        let mut buf = BytesMut::from(
            "\n\r\n{not json}\n{\"type\":\"exec_request\",\"id\":\"a\",\"command\":\"ls\"}\n",
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(FrameError::Malformed { .. })));

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(
            second,
            WorkerFrame::ExecRequest {
                id: RequestId::from("a"),
                command: "ls".to_string()
            }
        );

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_treats_non_utf8_line_as_malformed() {
        let mut codec = FrameCodec::<WorkerFrame>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\xff\xfe garbage\n");
        buf.extend_from_slice(b"{\"type\":\"done\",\"messages\":[]}\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let Err(FrameError::Malformed { snippet, .. }) = first else {
            panic!("expected malformed, got {first:?}");
        };
        assert!(snippet.ends_with(" garbage"));

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second, WorkerFrame::Done { messages: vec![] });
    }

    #[test]
    fn codec_buffers_partial_line() {
        let mut codec = FrameCodec::<WorkerFrame>::new();
        let mut buf = BytesMut::from("{\"type\":\"done\",");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"messages\":[]}\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(frame, WorkerFrame::Done { messages: vec![] });
    }

    #[test]
    fn codec_decodes_unterminated_last_line_at_eof() {
        let mut codec = FrameCodec::<WorkerFrame>::new();
        let mut buf = BytesMut::from("{\"type\":\"error\",\"message\":\"x\"}");
        let frame = codec.decode_eof(&mut buf).unwrap().unwrap().unwrap();
        assert!(matches!(frame, WorkerFrame::Error { .. }));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_oversized_line() {
        let mut codec = FrameCodec::<WorkerFrame>::with_max_frame_bytes(16);
        let mut buf = BytesMut::from(
            "{\"type\":\"error\",\"message\":\"this is definitely too long\"}\n",
        );
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLong { limit: 16 }));
    }

    #[test]
    fn codec_encodes_newline_terminated_json() {
        let mut codec = FrameCodec::<HostFrame>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                HostFrame::ExecResponse {
                    id: RequestId::from("1"),
                    output: "ok".to_string(),
                    exit_code: 0,
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(
            &buf[..],
            b"{\"type\":\"exec_response\",\"id\":\"1\",\"output\":\"ok\",\"exitCode\":0}\n"
        );
    }
}
