//! Plan model: ordered steps with monotonic status transitions.
//!
//! Plans are generated by the model as JSON; parsing tolerates code fences
//! and both the bare-array and `{"steps": [...]}` shapes. Re-planning
//! replaces the unfinished remainder while completed steps keep their
//! results; all ids are renumbered sequentially so step ids stay unique
//! within the plan's lifetime.

use serde::{Deserialize, Serialize};
use taskloom_core::error::PlanError;

/// Lifecycle of a step. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One unit of work in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// "step-1", "step-2", ... assigned at (re)numbering
    pub id: String,
    pub description: String,
    /// Tool the planner expects this step to lean on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_hint: Option<String>,
    pub status: StepStatus,
    /// Condensed outcome, set when the step finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
}

impl PlanStep {
    fn new(description: String, tool_hint: Option<String>) -> Self {
        Self {
            id: String::new(),
            description,
            tool_hint,
            status: StepStatus::Pending,
            result_summary: None,
        }
    }

    pub fn start(&mut self) {
        debug_assert_eq!(self.status, StepStatus::Pending);
        self.status = StepStatus::Running;
    }

    pub fn complete(&mut self, summary: impl Into<String>) {
        debug_assert_eq!(self.status, StepStatus::Running);
        self.status = StepStatus::Completed;
        self.result_summary = Some(summary.into());
    }

    pub fn fail(&mut self, summary: impl Into<String>) {
        debug_assert_eq!(self.status, StepStatus::Running);
        self.status = StepStatus::Failed;
        self.result_summary = Some(summary.into());
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// An ordered plan for a goal, with its re-plan count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub replans: u32,
}

#[derive(Deserialize)]
struct RawStep {
    description: String,
    #[serde(default, alias = "tool")]
    tool_hint: Option<String>,
}

impl Plan {
    /// Parse a plan from model output.
    pub fn parse(goal: &str, raw: &str) -> Result<Self, PlanError> {
        let steps = parse_steps(raw)?;
        if steps.is_empty() {
            return Err(PlanError::Unparseable("plan contained no steps".into()));
        }
        let mut plan = Self {
            goal: goal.to_string(),
            steps,
            replans: 0,
        };
        plan.renumber();
        Ok(plan)
    }

    /// Plans below the threshold are simple tasks better served by a
    /// single reactive turn.
    pub fn is_simple(&self, min_steps: usize) -> bool {
        self.steps.len() < min_steps
    }

    /// Index of the next step to run, if any.
    pub fn next_pending(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status == StepStatus::Pending)
    }

    pub fn completed_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
    }

    pub fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.is_terminal())
    }

    /// Replace the unfinished remainder with newly planned steps,
    /// preserving completed steps and their results. Failed and pending
    /// steps are dropped; everything is renumbered.
    pub fn replan(&mut self, raw: &str) -> Result<(), PlanError> {
        let new_steps = parse_steps(raw)?;
        if new_steps.is_empty() {
            return Err(PlanError::Unparseable("re-plan contained no steps".into()));
        }
        self.steps.retain(|s| s.status == StepStatus::Completed);
        self.steps.extend(new_steps);
        self.renumber();
        self.replans += 1;
        Ok(())
    }

    fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.id = format!("step-{}", i + 1);
        }
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.description.clone()).collect()
    }
}

/// Extract steps from raw model output: strip code fences, accept either
/// a bare JSON array or an object with a `steps` field.
fn parse_steps(raw: &str) -> Result<Vec<PlanStep>, PlanError> {
    let cleaned = strip_code_fences(raw);
    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|e| PlanError::Unparseable(format!("invalid JSON: {e}")))?;

    let items = match &value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(obj) => match obj.get("steps") {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => {
                return Err(PlanError::Unparseable(
                    "expected a steps array".into(),
                ))
            }
        },
        _ => return Err(PlanError::Unparseable("expected array or object".into())),
    };

    items
        .into_iter()
        .map(|item| {
            let raw: RawStep = serde_json::from_value(item)
                .map_err(|e| PlanError::Unparseable(format!("bad step: {e}")))?;
            Ok(PlanStep::new(raw.description, raw.tool_hint))
        })
        .collect()
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop an optional language tag on the fence line
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_STEPS: &str = r#"{"steps": [
        {"description": "gather sources", "tool_hint": "search"},
        {"description": "analyze findings"},
        {"description": "write the report", "tool": "file_write"}
    ]}"#;

    #[test]
    fn parses_object_form_with_hints() {
        let plan = Plan::parse("write a report", THREE_STEPS).unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].id, "step-1");
        assert_eq!(plan.steps[0].tool_hint.as_deref(), Some("search"));
        assert_eq!(plan.steps[1].tool_hint, None);
        // "tool" alias accepted
        assert_eq!(plan.steps[2].tool_hint.as_deref(), Some("file_write"));
    }

    #[test]
    fn parses_bare_array_in_code_fences() {
        let raw = "```json\n[{\"description\": \"a\"}, {\"description\": \"b\"}, {\"description\": \"c\"}]\n```";
        let plan = Plan::parse("goal", raw).unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[2].id, "step-3");
    }

    #[test]
    fn rejects_non_json() {
        assert!(Plan::parse("goal", "Step 1: just do it").is_err());
    }

    #[test]
    fn rejects_empty_steps() {
        assert!(Plan::parse("goal", r#"{"steps": []}"#).is_err());
    }

    #[test]
    fn simple_threshold() {
        let plan = Plan::parse("goal", r#"[{"description": "a"}, {"description": "b"}]"#).unwrap();
        assert!(plan.is_simple(3));
        let plan = Plan::parse("goal", THREE_STEPS).unwrap();
        assert!(!plan.is_simple(3));
    }

    #[test]
    fn step_lifecycle() {
        let mut plan = Plan::parse("goal", THREE_STEPS).unwrap();
        assert_eq!(plan.next_pending(), Some(0));
        plan.steps[0].start();
        plan.steps[0].complete("sources gathered");
        assert_eq!(plan.next_pending(), Some(1));
        assert_eq!(plan.completed_steps().count(), 1);
        assert!(!plan.all_terminal());
    }

    #[test]
    fn replan_preserves_completed_and_renumbers() {
        let mut plan = Plan::parse("goal", THREE_STEPS).unwrap();
        plan.steps[0].start();
        plan.steps[0].complete("sources gathered");
        plan.steps[1].start();
        plan.steps[1].fail("no data");

        plan.replan(r#"[{"description": "use cached data"}, {"description": "write the report"}]"#)
            .unwrap();

        assert_eq!(plan.replans, 1);
        assert_eq!(plan.steps.len(), 3);
        // completed step survived with its result
        assert_eq!(plan.steps[0].status, StepStatus::Completed);
        assert_eq!(plan.steps[0].result_summary.as_deref(), Some("sources gathered"));
        // ids renumbered sequentially
        assert_eq!(plan.steps[1].id, "step-2");
        assert_eq!(plan.steps[1].description, "use cached data");
        assert_eq!(plan.steps[2].id, "step-3");
        assert_eq!(plan.next_pending(), Some(1));
    }
}
