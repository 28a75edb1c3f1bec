//! Concurrent tool dispatch with ordered outcomes.
//!
//! A batch of invocations runs with bounded parallelism through an
//! order-preserving buffered stream: `outcome[i]` always corresponds to
//! `batch[i]` no matter which finishes first. Every failure mode —
//! unknown tool, bad arguments, execution error, timeout, denied
//! confirmation, cancellation — becomes a failed `ToolOutcome` the model
//! observes; nothing a tool does can abort the control loop.
//!
//! Confirmation gating suspends only the invocation that needs approval.
//! The dispatcher emits a `ConfirmationRequested` event carrying a fresh
//! correlation id and waits on the injected gate with a timeout; batch
//! siblings keep running.

use crate::event::{EngineEvent, EventSink};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskloom_config::ToolSettings;
use taskloom_core::message::MessageToolCall;
use taskloom_core::tool::{ConfirmationGate, ConfirmationRequest, ToolRegistry};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One tool call the model requested, positioned in its batch.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// The provider's call id; outcomes echo it back
    pub id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub batch_index: usize,
    pub batch_size: usize,
}

impl ToolInvocation {
    /// Build a batch from an assistant message's tool calls.
    pub fn batch(calls: &[MessageToolCall]) -> Vec<Self> {
        let batch_size = calls.len();
        calls
            .iter()
            .enumerate()
            .map(|(batch_index, call)| Self {
                id: call.id.clone(),
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                batch_index,
                batch_size,
            })
            .collect()
    }
}

/// The result of one invocation, success or failure.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub invocation_id: String,
    pub tool: String,
    pub success: bool,
    /// Shaped output, bounded for context injection
    pub preview: String,
    /// Whether shaping cut anything out of the raw output
    pub truncated: bool,
    pub duration_ms: u64,
}

/// Executes tool batches against the injected registry.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    gate: Option<Arc<dyn ConfirmationGate>>,
    settings: ToolSettings,
    events: EventSink,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, settings: ToolSettings, events: EventSink) -> Self {
        Self {
            registry,
            gate: None,
            settings,
            events,
        }
    }

    pub fn with_confirmation_gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run a batch. The returned vector has one outcome per invocation,
    /// in the batch's original order.
    pub async fn dispatch(
        &self,
        batch: &[ToolInvocation],
        cancel: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        futures::stream::iter(batch.iter().cloned())
            .map(|invocation| self.run_one(invocation, cancel))
            .buffered(self.settings.max_concurrency.max(1))
            .collect()
            .await
    }

    async fn run_one(
        &self,
        invocation: ToolInvocation,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let started = Instant::now();
        self.events.emit(EngineEvent::ToolCall {
            invocation_id: invocation.id.clone(),
            tool: invocation.tool.clone(),
            arguments: invocation.arguments.clone(),
            batch_index: invocation.batch_index,
            batch_size: invocation.batch_size,
        });

        let (success, raw_output) = self.execute(&invocation, cancel).await;
        let (preview, truncated) = shape_output(&raw_output, self.settings.max_output_chars);
        let duration_ms = started.elapsed().as_millis() as u64;

        self.events.emit(EngineEvent::ToolResult {
            invocation_id: invocation.id.clone(),
            tool: invocation.tool.clone(),
            success,
            preview: preview.clone(),
            duration_ms,
        });
        if !success {
            tracing::warn!(tool = %invocation.tool, output = %preview, "tool invocation failed");
        }

        ToolOutcome {
            invocation_id: invocation.id,
            tool: invocation.tool,
            success,
            preview,
            truncated,
            duration_ms,
        }
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> (bool, String) {
        let Some(tool) = self.registry.resolve(&invocation.tool) else {
            return (
                false,
                format!("Tool not found: {}", invocation.tool),
            );
        };

        if tool.requires_confirmation(&invocation.arguments) {
            match self.confirm(invocation, cancel).await {
                Approval::Granted => {}
                Approval::Denied(reason) => return (false, reason),
            }
        }

        let timeout = if tool.timeout() > Duration::ZERO {
            tool.timeout()
        } else {
            Duration::from_secs(self.settings.default_timeout_secs)
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, tool.execute(invocation.arguments.clone())) => {
                match result {
                    Ok(Ok(result)) => (result.success, result.output),
                    Ok(Err(err)) => (false, format!("Tool error: {err}")),
                    Err(_) => (
                        false,
                        format!(
                            "Tool timed out: {} after {}s",
                            invocation.tool,
                            timeout.as_secs()
                        ),
                    ),
                }
            }
            _ = cancel.cancelled() => {
                (false, format!("Tool cancelled: {}", invocation.tool))
            }
        }
    }

    async fn confirm(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Approval {
        let Some(gate) = &self.gate else {
            return Approval::Denied(format!(
                "Confirmation required for {} but no confirmation gate is configured",
                invocation.tool
            ));
        };

        let confirm_id = Uuid::new_v4().to_string();
        self.events.emit(EngineEvent::ConfirmationRequested {
            confirm_id: confirm_id.clone(),
            tool: invocation.tool.clone(),
            arguments: invocation.arguments.clone(),
        });

        let request = ConfirmationRequest {
            confirm_id,
            tool_name: invocation.tool.clone(),
            arguments: invocation.arguments.clone(),
        };
        let wait = Duration::from_secs(self.settings.confirmation_timeout_secs);

        tokio::select! {
            decision = tokio::time::timeout(wait, gate.decide(request)) => {
                match decision {
                    Ok(Some(true)) => Approval::Granted,
                    Ok(Some(false)) => Approval::Denied(format!(
                        "Confirmation denied for {}",
                        invocation.tool
                    )),
                    Ok(None) | Err(_) => Approval::Denied(format!(
                        "Confirmation timed out for {}",
                        invocation.tool
                    )),
                }
            }
            _ = cancel.cancelled() => {
                Approval::Denied(format!("Confirmation aborted for {}: turn stopped", invocation.tool))
            }
        }
    }
}

enum Approval {
    Granted,
    Denied(String),
}

/// Bound oversized output while keeping the informative ends: 60% of the
/// budget from the head, 20% from the tail, with an elision marker in
/// between. Cuts prefer line boundaries when one is reasonably close.
pub fn shape_output(output: &str, max_chars: usize) -> (String, bool) {
    if output.len() <= max_chars {
        return (output.to_string(), false);
    }

    let head_budget = max_chars * 60 / 100;
    let tail_budget = max_chars * 20 / 100;

    let head_cut = floor_char_boundary(output, head_budget);
    let head_slice = &output[..head_cut];
    let head = match head_slice.rfind('\n') {
        // Keep the cut on a line boundary unless that loses too much.
        Some(pos) if pos >= head_budget.saturating_sub(head_budget / 5) => &head_slice[..pos],
        _ => head_slice,
    };

    let tail_start = ceil_char_boundary(output, output.len() - tail_budget);
    let tail_slice = &output[tail_start..];
    let tail = match tail_slice.find('\n') {
        Some(pos) if pos <= tail_budget / 5 => &tail_slice[pos + 1..],
        _ => tail_slice,
    };

    let omitted_chars = output.len() - head.len() - tail.len();
    let omitted_lines = output[head.len()..output.len() - tail.len()]
        .matches('\n')
        .count();
    let shaped = format!(
        "{head}\n... [omitted {omitted_chars} chars, {omitted_lines} lines] ...\n{tail}"
    );
    (shaped, true)
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        ApproveAllGate, ConfirmEchoTool, CountingTool, DenyAllGate, FailingTool, ScriptedTool,
        SlowTool,
    };
    use std::sync::atomic::Ordering;

    fn settings() -> ToolSettings {
        ToolSettings {
            max_concurrency: 5,
            default_timeout_secs: 5,
            confirmation_timeout_secs: 1,
            max_output_chars: 3000,
        }
    }

    fn invocation(id: &str, tool: &str, args: serde_json::Value, index: usize, size: usize) -> ToolInvocation {
        ToolInvocation {
            id: id.into(),
            tool: tool.into(),
            arguments: args,
            batch_index: index,
            batch_size: size,
        }
    }

    fn dispatcher(registry: ToolRegistry) -> ToolDispatcher {
        ToolDispatcher::new(Arc::new(registry), settings(), EventSink::disabled())
    }

    #[tokio::test]
    async fn outcomes_keep_invocation_order() {
        let mut registry = ToolRegistry::new();
        // invocation 0 is the slowest; its outcome must still come first
        registry.register(Box::new(SlowTool::new("slow", Duration::from_millis(80))));
        registry.register(Box::new(ScriptedTool::new("fast_a", "a")));
        registry.register(Box::new(ScriptedTool::new("fast_b", "b")));
        let dispatcher = dispatcher(registry);

        let batch = vec![
            invocation("c0", "slow", serde_json::json!({}), 0, 3),
            invocation("c1", "fast_a", serde_json::json!({}), 1, 3),
            invocation("c2", "fast_b", serde_json::json!({}), 2, 3),
        ];
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].invocation_id, "c0");
        assert_eq!(outcomes[1].invocation_id, "c1");
        assert_eq!(outcomes[2].invocation_id, "c2");
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(FailingTool::new("broken")));
        registry.register(Box::new(ScriptedTool::new("fine", "ok")));
        let dispatcher = dispatcher(registry);

        let batch = vec![
            invocation("c0", "broken", serde_json::json!({}), 0, 2),
            invocation("c1", "fine", serde_json::json!({}), 1, 2),
        ];
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;

        assert!(!outcomes[0].success);
        assert!(outcomes[1].success);
        assert_eq!(outcomes[1].preview, "ok");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_outcome() {
        let dispatcher = dispatcher(ToolRegistry::new());
        let batch = vec![invocation("c0", "ghost", serde_json::json!({}), 0, 1)];
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].preview.contains("Tool not found"));
    }

    #[tokio::test]
    async fn slow_tool_times_out_into_failed_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(
            SlowTool::new("sluggish", Duration::from_secs(30)).with_timeout(Duration::from_millis(50)),
        ));
        let dispatcher = dispatcher(registry);
        let batch = vec![invocation("c0", "sluggish", serde_json::json!({}), 0, 1)];
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].preview.contains("timed out"));
    }

    #[tokio::test]
    async fn denied_confirmation_skips_execution() {
        let tool = CountingTool::new("guarded", true);
        let counter = tool.executions();
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(tool));
        let dispatcher =
            dispatcher(registry).with_confirmation_gate(Arc::new(DenyAllGate));

        let batch = vec![invocation("c0", "guarded", serde_json::json!({}), 0, 1)];
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;

        assert!(!outcomes[0].success);
        assert!(outcomes[0].preview.contains("denied"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn approved_confirmation_executes() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ConfirmEchoTool::new("guarded")));
        let dispatcher =
            dispatcher(registry).with_confirmation_gate(Arc::new(ApproveAllGate::default()));

        let batch = vec![invocation(
            "c0",
            "guarded",
            serde_json::json!({"text": "run it"}),
            0,
            1,
        )];
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].preview, "run it");
    }

    #[tokio::test]
    async fn confirmation_without_gate_is_denied() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ConfirmEchoTool::new("guarded")));
        let dispatcher = dispatcher(registry);

        let batch = vec![invocation("c0", "guarded", serde_json::json!({}), 0, 1)];
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].preview.contains("no confirmation gate"));
    }

    #[tokio::test]
    async fn confirmation_only_suspends_its_own_invocation() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ConfirmEchoTool::new("guarded")));
        registry.register(Box::new(ScriptedTool::new("free", "done")));
        // Gate that approves after a delay longer than the free tool needs.
        let dispatcher = dispatcher(registry).with_confirmation_gate(Arc::new(
            ApproveAllGate::with_delay(Duration::from_millis(60)),
        ));

        let batch = vec![
            invocation("c0", "guarded", serde_json::json!({"text": "ok"}), 0, 2),
            invocation("c1", "free", serde_json::json!({}), 1, 2),
        ];
        let started = Instant::now();
        let outcomes = dispatcher.dispatch(&batch, &CancellationToken::new()).await;

        assert!(outcomes[0].success);
        assert!(outcomes[1].success);
        // Whole batch bounded by the gate delay, not the sum of both paths.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancellation_fails_inflight_invocations() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(SlowTool::new("slow", Duration::from_secs(30))));
        let dispatcher = dispatcher(registry);
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_clone.cancel();
        });

        let batch = vec![invocation("c0", "slow", serde_json::json!({}), 0, 1)];
        let outcomes = dispatcher.dispatch(&batch, &cancel).await;
        assert!(!outcomes[0].success);
        assert!(outcomes[0].preview.contains("cancelled"));
    }

    #[test]
    fn shaping_keeps_head_and_tail() {
        let lines: Vec<String> = (0..200).map(|i| format!("line {i:03} {}", "x".repeat(40))).collect();
        let raw = lines.join("\n");
        let (shaped, truncated) = shape_output(&raw, 1000);

        assert!(truncated);
        assert!(shaped.len() < raw.len());
        assert!(shaped.contains("line 000"));
        assert!(shaped.contains("line 199"));
        assert!(shaped.contains("omitted"));
    }

    #[test]
    fn small_output_passes_through() {
        let (shaped, truncated) = shape_output("short", 3000);
        assert_eq!(shaped, "short");
        assert!(!truncated);
    }

    #[test]
    fn shaping_respects_utf8_boundaries() {
        let raw = "é".repeat(4000);
        let (shaped, truncated) = shape_output(&raw, 1000);
        assert!(truncated);
        assert!(shaped.contains("omitted"));
    }
}
