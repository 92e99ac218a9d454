//! Task executor that dispatches nothing.
//!
//! Every request is logged and answered with a single `system` message, so a
//! run walks every phase, audits every step, and ends with outputs unset.
//! Useful for checking that names resolve and templates render before
//! pointing a workflow at a real agent backend.

use std::sync::atomic::{AtomicUsize, Ordering};

use phaseflow_core::workflow::dispatch::{MessageStream, TaskExecutor};
use phaseflow_types::agent::{AgentMessage, DispatchRequest};
use serde_json::json;

#[derive(Debug, Default)]
pub struct DryRunExecutor {
    dispatched: AtomicUsize,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests seen so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }
}

impl TaskExecutor for DryRunExecutor {
    fn execute(&self, request: DispatchRequest) -> MessageStream {
        let sequence = self.dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            sequence,
            model = ?request.options.model,
            tools = ?request.options.tools,
            prompt_chars = request.prompt.len(),
            "dry run: dispatch skipped"
        );
        tracing::debug!(prompt = %request.prompt, "dry run: composed prompt");

        let data = json!({
            "dryRun": true,
            "sequence": sequence,
            "prompt": request.prompt,
            "model": request.options.model,
        });
        Box::pin(async_stream::stream! {
            yield Ok(AgentMessage::System {
                subtype: "dry_run".to_string(),
                data,
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaseflow_core::workflow::dispatch::collect_messages;
    use phaseflow_types::agent::DispatchOptions;

    #[tokio::test]
    async fn test_dry_run_yields_no_result() {
        let executor = DryRunExecutor::new();
        let request = DispatchRequest {
            prompt: "Implement the login form".to_string(),
            options: DispatchOptions::default(),
        };

        let outcome = collect_messages(executor.execute(request)).await.unwrap();
        assert_eq!(outcome.output, None);
        assert_eq!(outcome.message_count, 1);
        assert_eq!(executor.dispatched(), 1);
    }
}
