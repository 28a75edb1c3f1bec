//! The Taskloom orchestration engine.
//!
//! A turn follows a **Think → Act → Observe** cycle:
//!
//! 1. **Assemble** bounded context from six zones (system, environment,
//!    skills, knowledge, memory, history)
//! 2. **Complete** via the configured provider
//! 3. **If tool calls**: dispatch the batch concurrently, commit outcomes
//!    in invocation order, run loop/drift checks, go to 1
//! 4. **If text**: that's the answer
//!
//! The cycle ends on a final answer, the iteration limit (forced summary),
//! the detector's repeat ceiling, cancellation, or a terminal error.
//! Plan-execute mode wraps the same cycle: a generated plan runs step by
//! step, each step driving its own inner loop on a scratchpad.

pub mod context;
pub mod control;
pub mod detector;
pub mod dispatch;
pub mod event;
pub mod metrics;
pub mod plan;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{AssembledContext, ContextAssembler, Summarizer, ZoneReport, ZoneUsage};
pub use control::{ControlLoop, TurnOutcome, TurnStatus};
pub use detector::{LoopDetector, Verdict};
pub use dispatch::{ToolDispatcher, ToolInvocation, ToolOutcome};
pub use event::{EngineEvent, EventSink};
pub use metrics::{IterationRecord, RunMetrics, ToolCallRecord};
pub use plan::{Plan, PlanStep, StepStatus};
pub use supervisor::{PlanSupervisor, SupervisedRun};
