//! Run accounting: iterations, tokens, tool calls, wall time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskloom_core::provider::Usage;

/// One tool invocation as recorded in the metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// Per-iteration counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u32,
    pub tool_calls: usize,
    pub duration_ms: u64,
}

/// Aggregated accounting for one run (a turn, or a whole plan).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub iterations: u32,
    pub llm_calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub hit_max_iterations: bool,
    pub loop_detected: bool,
    pub tool_calls: Vec<ToolCallRecord>,
    pub iteration_records: Vec<IterationRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunMetrics {
    pub fn start() -> Self {
        Self {
            iterations: 0,
            llm_calls: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            hit_max_iterations: false,
            loop_detected: false,
            tool_calls: Vec::new(),
            iteration_records: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_usage(&mut self, usage: &Option<Usage>) {
        self.llm_calls += 1;
        if let Some(usage) = usage {
            self.prompt_tokens += usage.prompt_tokens as u64;
            self.completion_tokens += usage.completion_tokens as u64;
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Fold a sub-run (an inner step loop) into this aggregate.
    pub fn merge(&mut self, other: &RunMetrics) {
        self.iterations += other.iterations;
        self.llm_calls += other.llm_calls;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.hit_max_iterations |= other.hit_max_iterations;
        self.loop_detected |= other.loop_detected;
        self.tool_calls.extend(other.tool_calls.iter().cloned());
        self.iteration_records
            .extend(other.iteration_records.iter().cloned());
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} iterations, {} llm calls, {} tool calls ({} failed), {}+{} tokens, {}ms",
            self.iterations,
            self.llm_calls,
            self.tool_calls.len(),
            self.tool_calls.iter().filter(|t| !t.success).count(),
            self.prompt_tokens,
            self.completion_tokens,
            self.duration_ms(),
        )
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut metrics = RunMetrics::start();
        metrics.record_usage(&Some(Usage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        }));
        metrics.record_usage(&None);
        assert_eq!(metrics.llm_calls, 2);
        assert_eq!(metrics.prompt_tokens, 100);
        assert_eq!(metrics.completion_tokens, 20);
    }

    #[test]
    fn merge_folds_sub_runs() {
        let mut outer = RunMetrics::start();
        outer.iterations = 2;

        let mut inner = RunMetrics::start();
        inner.iterations = 3;
        inner.loop_detected = true;
        inner.tool_calls.push(ToolCallRecord {
            tool: "search".into(),
            success: false,
            duration_ms: 12,
        });

        outer.merge(&inner);
        assert_eq!(outer.iterations, 5);
        assert!(outer.loop_detected);
        assert_eq!(outer.tool_calls.len(), 1);
    }

    #[test]
    fn summary_mentions_failures() {
        let mut metrics = RunMetrics::start();
        metrics.tool_calls.push(ToolCallRecord {
            tool: "fetch".into(),
            success: false,
            duration_ms: 5,
        });
        metrics.finish();
        assert!(metrics.summary().contains("1 failed"));
    }
}
