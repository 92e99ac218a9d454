//! Task-executor seam.
//!
//! The engine never talks to an agent backend directly. It hands a composed
//! [`DispatchRequest`] to a [`TaskExecutor`] and consumes the returned message
//! stream. Only `result` messages matter for the step output, and only the
//! last one wins.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use phaseflow_types::agent::{AgentMessage, DispatchRequest};
use serde_json::Value;
use thiserror::Error;

/// Failure raised by a task executor, either up front or mid-stream.
#[derive(Debug, Clone, Error)]
#[error("task executor failed: {message}")]
pub struct DispatchError {
    pub message: String,
}

impl DispatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Stream of messages produced by one dispatch.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<AgentMessage, DispatchError>> + Send + 'static>>;

/// External function that runs a composed prompt.
///
/// The returned stream is lazy: nothing is expected to happen until it is
/// polled, and dropping it aborts the dispatch.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: DispatchRequest) -> MessageStream;
}

/// What a drained message stream produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    /// Structured payload of the last `result` message, if any.
    pub output: Option<Value>,
    /// Files touched by file-writing tool calls, in stream order.
    pub changed_files: Vec<String>,
    pub message_count: usize,
}

/// Drain a message stream, stopping at the first error.
pub async fn collect_messages(mut stream: MessageStream) -> Result<DispatchOutcome, DispatchError> {
    let mut outcome = DispatchOutcome::default();
    while let Some(message) = stream.next().await {
        let message = message?;
        outcome.message_count += 1;
        if let Some(path) = message.changed_file() {
            outcome.changed_files.push(path.to_string());
        }
        if let AgentMessage::Result { structured_output } = message {
            outcome.output = structured_output;
        }
    }
    Ok(outcome)
}
