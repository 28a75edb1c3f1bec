//! The reactive control loop.
//!
//! One `run` is one turn: inject skills and retrieved context, then cycle
//! think → act → observe until the model answers in text, the iteration
//! limit forces a summary, the detector's repeat ceiling trips, the turn
//! is cancelled, or a terminal error surfaces.
//!
//! State machine per turn:
//!
//! ```text
//! THINKING ──(tool calls)──► DISPATCH ──► OBSERVE ──► THINKING
//!     │                                       │
//!     │ (text)                                │ (limit / ceiling)
//!     ▼                                       ▼
//!  ANSWERING ──► DONE              FORCED SUMMARY ──► DONE
//! ```
//!
//! The conversation is committed only between suspension points: the
//! assistant's tool-call message and its outcomes land together after the
//! batch, so a cancellation mid-batch leaves the transcript exactly as it
//! was before the batch began.

use crate::context::{AssembledContext, CompletionSummarizer, ContextAssembler, Summarizer, ZoneReport};
use crate::detector::{LoopDetector, Verdict};
use crate::dispatch::{ToolDispatcher, ToolInvocation};
use crate::event::{EngineEvent, EventSink};
use crate::metrics::{IterationRecord, RunMetrics, ToolCallRecord};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskloom_config::Settings;
use taskloom_core::error::{Error, Result};
use taskloom_core::message::{Conversation, Message};
use taskloom_core::provider::{CompletionRequest, CompletionResponse, Provider, ToolDefinition};
use taskloom_core::retrieval::{Retriever, Snippet};
use taskloom_core::skill::{SkillPrompt, SkillRouter};
use taskloom_core::store::ConversationStore;
use taskloom_core::tool::{ConfirmationGate, ToolRegistry};
use tokio_util::sync::CancellationToken;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a capable task-execution agent. \
Use the available tools when they help; answer directly when they don't. \
Think before acting and keep tool usage purposeful.";

const FORCED_SUMMARY_PROMPT: &str = "Stop using tools now. Based on everything \
gathered so far, give your best final answer. If the task is incomplete, say \
what was done and what remains.";

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The model answered on its own
    Completed,
    /// The iteration limit (or repeat ceiling) forced a summary
    MaxIterations,
    /// The turn was cancelled; the transcript holds whatever was committed
    Stopped,
}

/// The result of one turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Final answer; `None` when the turn was stopped before one existed
    pub answer: Option<String>,
    pub status: TurnStatus,
    pub metrics: RunMetrics,
    /// Zone accounting from the last assembly of the turn
    pub last_report: Option<ZoneReport>,
}

/// Knobs the plan supervisor adjusts per step.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Override the configured per-turn iteration cap
    pub max_iterations: Option<u32>,
    /// Extra expected tools for the drift detector
    pub expected_tools: Vec<String>,
}

/// The reactive engine. Construct once, run many turns.
pub struct ControlLoop {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    settings: Settings,
    assembler: ContextAssembler,
    dispatcher: ToolDispatcher,
    summarizer: Arc<dyn Summarizer>,
    skill_router: Option<Arc<dyn SkillRouter>>,
    knowledge: Option<Arc<dyn Retriever>>,
    memory: Option<Arc<dyn Retriever>>,
    store: Option<Arc<dyn ConversationStore>>,
    system_prompt: String,
    environment: Option<Vec<(String, String)>>,
    events: EventSink,
}

impl ControlLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        settings: Settings,
        events: EventSink,
    ) -> Self {
        let assembler = ContextAssembler::new(settings.context.clone());
        let dispatcher =
            ToolDispatcher::new(registry.clone(), settings.tools.clone(), events.clone());
        let summarizer: Arc<dyn Summarizer> = Arc::new(CompletionSummarizer::new(
            provider.clone(),
            settings.model.clone(),
        ));
        Self {
            provider,
            registry,
            settings,
            assembler,
            dispatcher,
            summarizer,
            skill_router: None,
            knowledge: None,
            memory: None,
            store: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            environment: None,
            events,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Fixed environment zone content. Defaults to the current UTC time.
    pub fn with_environment(mut self, environment: Vec<(String, String)>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_skill_router(mut self, router: Arc<dyn SkillRouter>) -> Self {
        self.skill_router = Some(router);
        self
    }

    pub fn with_knowledge_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.knowledge = Some(retriever);
        self
    }

    pub fn with_memory_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.memory = Some(retriever);
        self
    }

    pub fn with_confirmation_gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.dispatcher = ToolDispatcher::new(
            self.registry.clone(),
            self.settings.tools.clone(),
            self.events.clone(),
        )
        .with_confirmation_gate(gate);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    /// Run one turn with default options.
    pub async fn run(
        &self,
        user_message: &str,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.run_with(user_message, conversation, cancel, TurnOptions::default())
            .await
    }

    /// Run one turn.
    pub async fn run_with(
        &self,
        user_message: &str,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
        options: TurnOptions,
    ) -> Result<TurnOutcome> {
        let max_iterations = options
            .max_iterations
            .unwrap_or(self.settings.limits.max_iterations);
        let mut metrics = RunMetrics::start();
        let mut last_report: Option<ZoneReport> = None;

        conversation.push(Message::user(user_message));

        // Per-turn collaborator injection: skills and retrieval happen once,
        // against the incoming message, and flow through the assembler only.
        let skills = self.route_skills(user_message).await;
        let knowledge = self.retrieve(&self.knowledge, user_message).await;
        let memories = self.retrieve(&self.memory, user_message).await;

        let mut expected_tools = options.expected_tools;
        for skill in &skills {
            expected_tools.extend(skill.required_tools.iter().cloned());
        }
        let mut detector =
            LoopDetector::new(self.settings.detector.clone()).with_expected_tools(expected_tools);

        let environment = self.environment.clone().unwrap_or_else(|| {
            vec![("current_time".to_string(), Utc::now().to_rfc3339())]
        });
        let definitions = self.registry.definitions();

        let mut ceiling_reason: Option<String> = None;
        let mut iteration = 0u32;

        while iteration < max_iterations {
            iteration += 1;
            metrics.iterations = iteration;

            if cancel.is_cancelled() {
                return self
                    .finish_stopped(conversation, metrics, last_report, iteration)
                    .await;
            }

            self.events.emit(EngineEvent::IterationStarted {
                iteration,
                max_iterations,
            });
            let iteration_started = Instant::now();

            let assembled = self
                .assemble(&environment, &definitions, &skills, &knowledge, &memories, conversation)
                .await;
            let assembled = match assembled {
                Ok(ctx) => ctx,
                Err(err) => return self.finish_error(err, metrics).await,
            };
            last_report = Some(assembled.report.clone());

            let request = CompletionRequest::new(&self.settings.model, assembled.messages)
                .with_temperature(self.settings.temperature)
                .with_max_tokens(self.settings.max_tokens)
                .with_tools(definitions.clone());

            let response = match self.complete_with_retry(request, cancel).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    return self
                        .finish_stopped(conversation, metrics, last_report, iteration)
                        .await;
                }
                Err(err) => return self.finish_error(err, metrics).await,
            };
            metrics.record_usage(&response.usage);

            if !response.has_tool_calls() {
                let answer = response.message.content.clone();
                conversation.push(response.message);
                return self
                    .finish_done(
                        conversation,
                        answer,
                        TurnStatus::Completed,
                        metrics,
                        last_report,
                        iteration,
                    )
                    .await;
            }

            // Act: run the batch, then commit assistant message + outcomes
            // atomically. A cancellation observed after dispatch discards
            // everything from this batch.
            let invocations = ToolInvocation::batch(&response.message.tool_calls);
            for invocation in &invocations {
                detector.observe_call(&invocation.tool, &invocation.arguments);
            }
            let outcomes = self.dispatcher.dispatch(&invocations, cancel).await;
            if cancel.is_cancelled() {
                return self
                    .finish_stopped(conversation, metrics, last_report, iteration)
                    .await;
            }

            conversation.push(response.message);
            for outcome in &outcomes {
                detector.observe_result(&outcome.tool, &outcome.preview);
                metrics.tool_calls.push(ToolCallRecord {
                    tool: outcome.tool.clone(),
                    success: outcome.success,
                    duration_ms: outcome.duration_ms,
                });
                let content = if outcome.success {
                    outcome.preview.clone()
                } else {
                    format!("[failed] {}", outcome.preview)
                };
                conversation.push(Message::tool_result(outcome.invocation_id.clone(), content));
            }

            metrics.iteration_records.push(IterationRecord {
                index: iteration,
                tool_calls: outcomes.len(),
                duration_ms: iteration_started.elapsed().as_millis() as u64,
            });

            match detector.verdict(iteration, user_message) {
                Verdict::Proceed => {}
                Verdict::Nudge(note) => {
                    metrics.loop_detected = true;
                    tracing::info!(note = %note, "corrective note injected");
                    conversation.push(Message::system(format!("[Guidance] {note}")));
                }
                Verdict::Terminate(reason) => {
                    metrics.loop_detected = true;
                    tracing::warn!(reason = %reason, "repeat ceiling hit, forcing final answer");
                    ceiling_reason = Some(reason);
                    break;
                }
            }
        }

        // Out of budget: one tools-disabled completion to summarize.
        if ceiling_reason.is_none() {
            self.events.emit(EngineEvent::MaxIterations {
                iterations: iteration,
            });
        }
        metrics.hit_max_iterations = ceiling_reason.is_none();

        let instruction = match &ceiling_reason {
            Some(reason) => format!("{FORCED_SUMMARY_PROMPT} (Stopping because {reason}.)"),
            None => FORCED_SUMMARY_PROMPT.to_string(),
        };
        conversation.push(Message::user(instruction));

        // The summary request carries no tools, so none are charged.
        let assembled = self
            .assemble(&environment, &[], &skills, &knowledge, &memories, conversation)
            .await;
        let assembled = match assembled {
            Ok(ctx) => ctx,
            Err(err) => return self.finish_error(err, metrics).await,
        };
        last_report = Some(assembled.report.clone());

        let request = CompletionRequest::new(&self.settings.model, assembled.messages)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens)
            .text_only();
        let response = match self.complete_with_retry(request, cancel).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return self
                    .finish_stopped(conversation, metrics, last_report, iteration)
                    .await;
            }
            Err(err) => return self.finish_error(err, metrics).await,
        };
        metrics.record_usage(&response.usage);

        let answer = response.message.content.clone();
        conversation.push(response.message);
        self.finish_done(
            conversation,
            answer,
            TurnStatus::MaxIterations,
            metrics,
            last_report,
            iteration,
        )
        .await
    }

    async fn assemble(
        &self,
        environment: &[(String, String)],
        tools: &[ToolDefinition],
        skills: &[SkillPrompt],
        knowledge: &[Snippet],
        memories: &[Snippet],
        conversation: &mut Conversation,
    ) -> Result<AssembledContext> {
        self.assembler
            .assemble(
                &self.system_prompt,
                environment,
                tools,
                skills,
                knowledge,
                memories,
                conversation,
                self.summarizer.as_ref(),
            )
            .await
    }

    async fn route_skills(&self, user_message: &str) -> Vec<SkillPrompt> {
        match &self.skill_router {
            Some(router) => {
                let skills = router.select(user_message).await;
                if !skills.is_empty() {
                    tracing::debug!(
                        skills = ?skills.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                        "skills routed for turn"
                    );
                }
                skills
            }
            None => Vec::new(),
        }
    }

    async fn retrieve(
        &self,
        retriever: &Option<Arc<dyn Retriever>>,
        query: &str,
    ) -> Vec<Snippet> {
        match retriever {
            Some(retriever) => {
                retriever
                    .search(query, self.settings.context.retrieval_top_k)
                    .await
            }
            None => Vec::new(),
        }
    }

    /// Completion with bounded retries and exponential backoff on the
    /// transient subset of provider errors. `Ok(None)` means the turn was
    /// cancelled while waiting.
    pub(crate) async fn complete_with_retry(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<CompletionResponse>> {
        let max_attempts = self.settings.retry.max_attempts;
        let mut backoff = Duration::from_millis(self.settings.retry.initial_backoff_ms);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.provider.complete(request.clone()).await {
                Ok(response) => return Ok(Some(response)),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        error = %err,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "completion failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Ok(None),
                    }
                    backoff *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn finish_done(
        &self,
        conversation: &Conversation,
        answer: String,
        status: TurnStatus,
        mut metrics: RunMetrics,
        last_report: Option<ZoneReport>,
        iterations: u32,
    ) -> Result<TurnOutcome> {
        metrics.finish();
        self.persist(conversation).await;
        self.events
            .emit_terminal(EngineEvent::Done {
                answer: answer.clone(),
                iterations,
            })
            .await;
        tracing::info!(status = ?status, "turn finished: {}", metrics.summary());
        Ok(TurnOutcome {
            answer: Some(answer),
            status,
            metrics,
            last_report,
        })
    }

    async fn finish_stopped(
        &self,
        conversation: &Conversation,
        mut metrics: RunMetrics,
        last_report: Option<ZoneReport>,
        iterations: u32,
    ) -> Result<TurnOutcome> {
        metrics.finish();
        self.persist(conversation).await;
        self.events
            .emit_terminal(EngineEvent::Stopped { iterations })
            .await;
        tracing::info!("turn stopped by cancellation: {}", metrics.summary());
        Ok(TurnOutcome {
            answer: None,
            status: TurnStatus::Stopped,
            metrics,
            last_report,
        })
    }

    async fn finish_error(&self, err: Error, mut metrics: RunMetrics) -> Result<TurnOutcome> {
        metrics.finish();
        self.events
            .emit_terminal(EngineEvent::Error {
                message: err.to_string(),
            })
            .await;
        tracing::error!(error = %err, "turn failed: {}", metrics.summary());
        Err(err)
    }

    async fn persist(&self, conversation: &Conversation) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(conversation).await {
                tracing::warn!(error = %err, "failed to persist conversation");
            }
        }
    }
}
