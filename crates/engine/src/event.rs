//! Typed engine events.
//!
//! Observers subscribe through a bounded channel. Telemetry-grade events
//! (iterations, tool activity, plan progress) are fire-and-forget: under
//! backpressure they are dropped and counted, never blocking the loop.
//! Terminal events (done, error, stopped) are awaited — a slow observer
//! delays shutdown rather than losing the outcome of the run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted over the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A think-act-observe iteration is starting
    IterationStarted { iteration: u32, max_iterations: u32 },

    /// The model requested a tool invocation
    ToolCall {
        invocation_id: String,
        tool: String,
        arguments: serde_json::Value,
        batch_index: usize,
        batch_size: usize,
    },

    /// A tool invocation finished
    ToolResult {
        invocation_id: String,
        tool: String,
        success: bool,
        preview: String,
        duration_ms: u64,
    },

    /// An invocation is suspended awaiting human approval
    ConfirmationRequested {
        confirm_id: String,
        tool: String,
        arguments: serde_json::Value,
    },

    /// A plan was generated
    PlanCreated { step_descriptions: Vec<String> },

    /// A plan step began executing
    StepStarted { step_id: String, description: String },

    /// A plan step finished
    StepDone {
        step_id: String,
        success: bool,
        summary: String,
    },

    /// The plan was regenerated after a step failure
    Replanned { replans: u32, reason: String },

    /// The iteration limit was reached; a forced summary follows
    MaxIterations { iterations: u32 },

    /// The run was cancelled mid-turn
    Stopped { iterations: u32 },

    /// The run failed terminally
    Error { message: String },

    /// The run produced a final answer
    Done { answer: String, iterations: u32 },
}

impl EngineEvent {
    /// Terminal events are never dropped under backpressure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. } | Self::Stopped { .. })
    }

    /// Event name as it appears on the wire.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::IterationStarted { .. } => "iteration_started",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::PlanCreated { .. } => "plan_created",
            Self::StepStarted { .. } => "step_started",
            Self::StepDone { .. } => "step_done",
            Self::Replanned { .. } => "replanned",
            Self::MaxIterations { .. } => "max_iterations",
            Self::Stopped { .. } => "stopped",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}

/// Bounded event outlet handed to the engine.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    /// Create a sink and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// A sink nobody listens to. Sends become no-ops.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// Emit a telemetry event. Dropped (and debug-logged) when the channel
    /// is full or closed.
    pub fn emit(&self, event: EngineEvent) {
        if let Err(err) = self.tx.try_send(event) {
            match err {
                mpsc::error::TrySendError::Full(ev) => {
                    tracing::debug!(event = ev.event_type(), "event dropped: observer backpressure");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    /// Emit a terminal event, waiting out backpressure. A closed channel
    /// (observer gone) is not an error.
    pub async fn emit_terminal(&self, event: EngineEvent) {
        debug_assert!(event.is_terminal());
        let _ = self.tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_uses_snake_case_tags() {
        let event = EngineEvent::IterationStarted {
            iteration: 1,
            max_iterations: 10,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"iteration_started""#));
    }

    #[test]
    fn terminal_classification() {
        assert!(EngineEvent::Done {
            answer: "x".into(),
            iterations: 1
        }
        .is_terminal());
        assert!(EngineEvent::Stopped { iterations: 0 }.is_terminal());
        assert!(!EngineEvent::MaxIterations { iterations: 3 }.is_terminal());
    }

    #[tokio::test]
    async fn telemetry_dropped_under_backpressure() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(EngineEvent::IterationStarted {
            iteration: 1,
            max_iterations: 3,
        });
        // channel full: this one is dropped silently
        sink.emit(EngineEvent::IterationStarted {
            iteration: 2,
            max_iterations: 3,
        });
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, EngineEvent::IterationStarted { iteration: 1, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_event_waits_for_capacity() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(EngineEvent::IterationStarted {
            iteration: 1,
            max_iterations: 3,
        });

        let sender = tokio::spawn(async move {
            sink.emit_terminal(EngineEvent::Done {
                answer: "final".into(),
                iterations: 1,
            })
            .await;
        });

        // Drain the telemetry event; the terminal send completes after.
        let _ = rx.recv().await.unwrap();
        sender.await.unwrap();
        let terminal = rx.recv().await.unwrap();
        assert!(matches!(terminal, EngineEvent::Done { .. }));
    }

    #[tokio::test]
    async fn disabled_sink_accepts_everything() {
        let sink = EventSink::disabled();
        sink.emit(EngineEvent::MaxIterations { iterations: 5 });
        sink.emit_terminal(EngineEvent::Error {
            message: "boom".into(),
        })
        .await;
    }
}
