//! Plan-execute mode: decompose, run steps sequentially, synthesize.
//!
//! The supervisor asks the model for an ordered plan, then drives each
//! step through an inner control-loop run on a scratchpad: a clone of
//! the transcript absorbs the step's working messages (and any history
//! compression the inner loop performs), is discarded afterwards, and a
//! single condensed result message is settled instead. Step failures
//! trigger bounded re-planning that preserves completed work; exhausting
//! the re-plan budget is a terminal failure, not a silent stop.
//!
//! Degenerate plans (too few steps, or unparseable output) fall back to a
//! single reactive turn — planning overhead isn't worth it for simple
//! tasks.

use crate::control::{ControlLoop, TurnOptions, TurnStatus};
use crate::event::EngineEvent;
use crate::metrics::RunMetrics;
use crate::plan::Plan;
use taskloom_core::error::{Error, PlanError, Result};
use taskloom_core::message::{Conversation, Message};
use taskloom_core::provider::CompletionRequest;
use tokio_util::sync::CancellationToken;

const STEP_FAILED_MARKER: &str = "STEP FAILED";
const RESULT_SUMMARY_CHARS: usize = 500;

/// The result of a supervised (plan-execute) run.
#[derive(Debug, Clone)]
pub struct SupervisedRun {
    pub answer: Option<String>,
    pub status: TurnStatus,
    /// The final plan, `None` when the run fell back to reactive mode
    pub plan: Option<Plan>,
    pub metrics: RunMetrics,
}

/// Drives plan-execute runs on top of a [`ControlLoop`].
pub struct PlanSupervisor {
    control: ControlLoop,
}

impl PlanSupervisor {
    pub fn new(control: ControlLoop) -> Self {
        Self { control }
    }

    /// Plan the goal and execute it step by step.
    pub async fn run(
        &self,
        goal: &str,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<SupervisedRun> {
        let settings = self.control.settings().clone();
        let mut metrics = RunMetrics::start();

        let mut plan = match self.generate_plan(goal, cancel, &mut metrics).await? {
            Some(plan) if !plan.is_simple(settings.plan.min_plan_steps) => plan,
            Some(plan) => {
                tracing::info!(
                    steps = plan.steps.len(),
                    "plan too small, falling back to a reactive turn"
                );
                return self.reactive_fallback(goal, conversation, cancel, metrics).await;
            }
            None => {
                return self.reactive_fallback(goal, conversation, cancel, metrics).await;
            }
        };

        self.control.events().emit(EngineEvent::PlanCreated {
            step_descriptions: plan.descriptions(),
        });
        tracing::info!(steps = plan.steps.len(), goal, "plan created");

        while let Some(index) = plan.next_pending() {
            if cancel.is_cancelled() {
                metrics.finish();
                self.control
                    .events()
                    .emit_terminal(EngineEvent::Stopped {
                        iterations: metrics.iterations,
                    })
                    .await;
                return Ok(SupervisedRun {
                    answer: None,
                    status: TurnStatus::Stopped,
                    plan: Some(plan),
                    metrics,
                });
            }

            let (step_id, description, tool_hint) = {
                let step = &mut plan.steps[index];
                step.start();
                (step.id.clone(), step.description.clone(), step.tool_hint.clone())
            };
            self.control.events().emit(EngineEvent::StepStarted {
                step_id: step_id.clone(),
                description: description.clone(),
            });

            let prompt = step_prompt(&plan, goal, &description, tool_hint.as_deref());
            let options = TurnOptions {
                max_iterations: Some(settings.limits.step_max_iterations.min(10)),
                expected_tools: tool_hint.iter().cloned().collect(),
            };

            // Scratchpad: the step runs on a clone of the transcript.
            // Whatever the inner loop adds or compresses there is
            // discarded; only the condensed result settles below.
            let mut scratch = conversation.clone();
            let outcome = self
                .control
                .run_with(&prompt, &mut scratch, cancel, options)
                .await?;
            metrics.merge(&outcome.metrics);

            if outcome.status == TurnStatus::Stopped {
                metrics.finish();
                return Ok(SupervisedRun {
                    answer: None,
                    status: TurnStatus::Stopped,
                    plan: Some(plan),
                    metrics,
                });
            }

            let answer = outcome.answer.unwrap_or_default();
            let failed = answer.trim_start().starts_with(STEP_FAILED_MARKER);
            let summary = condense(&answer);

            if failed {
                plan.steps[index].fail(summary.clone());
                self.control.events().emit(EngineEvent::StepDone {
                    step_id: step_id.clone(),
                    success: false,
                    summary: summary.clone(),
                });
                tracing::warn!(step = %step_id, reason = %summary, "plan step failed");

                if plan.replans >= settings.plan.max_replans {
                    let err = PlanError::ReplanBudgetExhausted {
                        replans: plan.replans,
                        failed_step: step_id,
                    };
                    metrics.finish();
                    self.control
                        .events()
                        .emit_terminal(EngineEvent::Error {
                            message: err.to_string(),
                        })
                        .await;
                    return Err(err.into());
                }
                self.replan(&mut plan, goal, &summary, cancel, &mut metrics)
                    .await?;
            } else {
                plan.steps[index].complete(summary.clone());
                conversation.push(Message::system(format!(
                    "[{step_id} result] {summary}"
                )));
                self.control.events().emit(EngineEvent::StepDone {
                    step_id,
                    success: true,
                    summary,
                });
            }
        }

        let answer = self.synthesize(&plan, goal, cancel, &mut metrics).await?;
        conversation.push(Message::assistant(answer.clone()));
        metrics.finish();
        self.control
            .events()
            .emit_terminal(EngineEvent::Done {
                answer: answer.clone(),
                iterations: metrics.iterations,
            })
            .await;
        tracing::info!(replans = plan.replans, "plan finished: {}", metrics.summary());

        Ok(SupervisedRun {
            answer: Some(answer),
            status: TurnStatus::Completed,
            plan: Some(plan),
            metrics,
        })
    }

    /// Ask the model for a plan. `Ok(None)` means the output was not a
    /// usable plan and the caller should fall back to reactive mode.
    async fn generate_plan(
        &self,
        goal: &str,
        cancel: &CancellationToken,
        metrics: &mut RunMetrics,
    ) -> Result<Option<Plan>> {
        let settings = self.control.settings();
        let request = CompletionRequest::new(
            &settings.model,
            vec![Message::user(planning_prompt(goal))],
        )
        .with_temperature(settings.plan.planner_temperature)
        .text_only();

        let response = match self.control.complete_with_retry(request, cancel).await? {
            Some(response) => response,
            None => return Ok(None),
        };
        metrics.record_usage(&response.usage);

        match Plan::parse(goal, &response.message.content) {
            Ok(plan) => Ok(Some(plan)),
            Err(err) => {
                tracing::warn!(error = %err, "plan output unusable, falling back");
                Ok(None)
            }
        }
    }

    async fn replan(
        &self,
        plan: &mut Plan,
        goal: &str,
        failure: &str,
        cancel: &CancellationToken,
        metrics: &mut RunMetrics,
    ) -> Result<()> {
        let settings = self.control.settings();
        let request = CompletionRequest::new(
            &settings.model,
            vec![Message::user(replanning_prompt(plan, goal, failure))],
        )
        .with_temperature(settings.plan.planner_temperature)
        .text_only();

        let response = match self.control.complete_with_retry(request, cancel).await? {
            Some(response) => response,
            None => {
                return Err(Error::Plan(PlanError::GenerationFailed(
                    "re-planning cancelled".into(),
                )))
            }
        };
        metrics.record_usage(&response.usage);

        plan.replan(&response.message.content).map_err(Error::Plan)?;
        self.control.events().emit(EngineEvent::Replanned {
            replans: plan.replans,
            reason: failure.to_string(),
        });
        tracing::info!(replans = plan.replans, "plan regenerated after step failure");
        Ok(())
    }

    async fn synthesize(
        &self,
        plan: &Plan,
        goal: &str,
        cancel: &CancellationToken,
        metrics: &mut RunMetrics,
    ) -> Result<String> {
        let settings = self.control.settings();
        let request = CompletionRequest::new(
            &settings.model,
            vec![Message::user(synthesis_prompt(plan, goal))],
        )
        .with_temperature(settings.temperature)
        .text_only();

        let response = match self.control.complete_with_retry(request, cancel).await? {
            Some(response) => response,
            None => {
                // Cancelled at the very end: fall back to the raw step results.
                return Ok(plan
                    .completed_steps()
                    .filter_map(|s| s.result_summary.clone())
                    .collect::<Vec<_>>()
                    .join("\n"));
            }
        };
        metrics.record_usage(&response.usage);
        Ok(response.message.content)
    }

    async fn reactive_fallback(
        &self,
        goal: &str,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
        mut metrics: RunMetrics,
    ) -> Result<SupervisedRun> {
        let outcome = self.control.run(goal, conversation, cancel).await?;
        metrics.merge(&outcome.metrics);
        metrics.finish();
        Ok(SupervisedRun {
            answer: outcome.answer,
            status: outcome.status,
            plan: None,
            metrics,
        })
    }
}

fn planning_prompt(goal: &str) -> String {
    format!(
        "Break this goal into 3-7 ordered, concrete steps. Respond with JSON \
         only, no prose:\n\
         {{\"steps\": [{{\"description\": \"...\", \"tool_hint\": \"optional tool name\"}}]}}\n\
         If the goal needs only one or two actions, return that many steps.\n\n\
         Goal: {goal}"
    )
}

fn replanning_prompt(plan: &Plan, goal: &str, failure: &str) -> String {
    let completed = completed_summary(plan);
    format!(
        "A step of the plan failed. Plan the remaining work, starting from \
         what is already done. Respond with JSON only, same shape as before:\n\
         {{\"steps\": [{{\"description\": \"...\", \"tool_hint\": \"optional tool name\"}}]}}\n\n\
         Goal: {goal}\n\
         Completed so far:\n{completed}\n\
         Failure: {failure}"
    )
}

fn synthesis_prompt(plan: &Plan, goal: &str) -> String {
    let completed = completed_summary(plan);
    format!(
        "All plan steps are done. Write the final answer for the user. Be \
         direct; do not describe the plan itself.\n\n\
         Goal: {goal}\n\
         Step results:\n{completed}"
    )
}

fn step_prompt(plan: &Plan, goal: &str, description: &str, tool_hint: Option<&str>) -> String {
    let mut prompt = format!(
        "You are executing one step of a larger plan.\n\
         Overall goal: {goal}\n\
         Current step: {description}\n"
    );
    if let Some(hint) = tool_hint {
        prompt.push_str(&format!("Suggested tool: {hint}\n"));
    }
    let completed = completed_summary(plan);
    if !completed.is_empty() {
        prompt.push_str(&format!("Completed so far:\n{completed}\n"));
    }
    prompt.push_str(
        "Complete only this step. If it cannot be completed, reply starting \
         with \"STEP FAILED:\" followed by the reason.",
    );
    prompt
}

fn completed_summary(plan: &Plan) -> String {
    plan.completed_steps()
        .map(|s| {
            format!(
                "- {} ({}): {}",
                s.id,
                s.description,
                s.result_summary.as_deref().unwrap_or("done")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn condense(answer: &str) -> String {
    let trimmed = answer.trim();
    if trimmed.len() <= RESULT_SUMMARY_CHARS {
        return trimmed.to_string();
    }
    let mut cut = RESULT_SUMMARY_CHARS;
    while cut > 0 && !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}
