//! The context assembler: deterministic, layered, budget-aware.
//!
//! Assembly order is fixed: System, Environment, Skill, Knowledge, Memory,
//! History. The first two are reserved, as are the tool definitions the
//! request will carry — if those alone exceed the input budget the
//! configuration is broken and assembly fails fast. The three
//! injected zones each carry a hard cap and drop whole items from the tail
//! (inputs arrive ranked best-first). History gets whatever budget remains;
//! when it overflows, the oldest block is summarized into one synthetic
//! message and replaced in place, repeatedly, until the transcript fits or
//! only the verbatim floor of most-recent messages is left.
//!
//! Retrieved content flows through the assembler only; it is never written
//! into the conversation. History compression is the one mutation, and it
//! happens on the conversation itself so the summarized transcript persists
//! across iterations instead of being recomputed.

use crate::context::token::{
    estimate_message_tokens, estimate_messages_tokens, estimate_tools_tokens,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskloom_config::ContextSettings;
use taskloom_core::error::{Error, ProviderError, Result};
use taskloom_core::message::{Conversation, Message};
use taskloom_core::provider::{CompletionRequest, Provider, ToolDefinition};
use taskloom_core::retrieval::Snippet;
use taskloom_core::skill::SkillPrompt;

/// Summarizes a block of messages for history compression.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        messages: &[Message],
    ) -> std::result::Result<String, ProviderError>;
}

/// Summarizer backed by the completion provider.
pub struct CompletionSummarizer {
    provider: Arc<dyn Provider>,
    model: String,
}

impl CompletionSummarizer {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Summarizer for CompletionSummarizer {
    async fn summarize(
        &self,
        messages: &[Message],
    ) -> std::result::Result<String, ProviderError> {
        let transcript = messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize this conversation excerpt. Keep: established facts, \
             decisions and conclusions, unresolved questions. Drop pleasantries \
             and dead ends. Be dense.\n\n{transcript}"
        );
        let request = CompletionRequest::new(&self.model, vec![Message::user(prompt)])
            .with_temperature(0.2)
            .text_only();
        let response = self.provider.complete(request).await?;
        Ok(response.message.content)
    }
}

/// Per-zone accounting after assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneUsage {
    /// Zone name: system, environment, tools, skill, knowledge, memory,
    /// history
    pub zone: String,

    /// Tokens the zone occupies in the assembled context
    pub tokens: usize,

    /// The zone's cap, if it has one
    pub budget: Option<usize>,

    /// Whether anything was cut to fit
    pub truncated: bool,

    /// Whole items dropped (skill/knowledge/memory) or messages
    /// compressed away (history)
    pub items_dropped: usize,
}

/// Where every token went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneReport {
    pub zones: Vec<ZoneUsage>,
    pub total_tokens: usize,
    pub input_budget: usize,
}

impl ZoneReport {
    pub fn utilization_pct(&self) -> f64 {
        if self.input_budget == 0 {
            return 0.0;
        }
        (self.total_tokens as f64 / self.input_budget as f64) * 100.0
    }

    pub fn zone(&self, name: &str) -> Option<&ZoneUsage> {
        self.zones.iter().find(|z| z.zone == name)
    }
}

/// The assembled request context plus its accounting.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    pub report: ZoneReport,
}

/// Builds the message list for each completion request.
pub struct ContextAssembler {
    settings: ContextSettings,
}

impl ContextAssembler {
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    /// Assemble the six zones into an ordered message list.
    ///
    /// May mutate `conversation`: history compression replaces old message
    /// blocks with synthetic summaries. The most recent
    /// `history_floor` messages are never touched.
    pub async fn assemble(
        &self,
        system_prompt: &str,
        environment: &[(String, String)],
        tools: &[ToolDefinition],
        skills: &[SkillPrompt],
        knowledge: &[Snippet],
        memories: &[Snippet],
        conversation: &mut Conversation,
        summarizer: &dyn Summarizer,
    ) -> Result<AssembledContext> {
        let input_budget = self.settings.input_budget();
        let mut messages = Vec::new();
        let mut zones = Vec::new();

        // Reserved zones first. These never shrink; if they don't fit,
        // the configuration is wrong and we refuse to assemble.
        let system_msg = Message::system(system_prompt);
        let system_tokens = estimate_message_tokens(&system_msg);
        zones.push(ZoneUsage {
            zone: "system".into(),
            tokens: system_tokens,
            budget: None,
            truncated: false,
            items_dropped: 0,
        });
        messages.push(system_msg);

        let mut reserved = system_tokens;
        if !environment.is_empty() {
            let body = environment
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n");
            let env_msg = Message::system(format!("## Environment\n{body}"));
            let env_tokens = estimate_message_tokens(&env_msg);
            zones.push(ZoneUsage {
                zone: "environment".into(),
                tokens: env_tokens,
                budget: None,
                truncated: false,
                items_dropped: 0,
            });
            reserved += env_tokens;
            messages.push(env_msg);
        } else {
            zones.push(ZoneUsage {
                zone: "environment".into(),
                tokens: 0,
                budget: None,
                truncated: false,
                items_dropped: 0,
            });
        }

        // Tool definitions ride in the request payload rather than as a
        // message, but they spend the same window.
        let tools_tokens = estimate_tools_tokens(tools);
        zones.push(ZoneUsage {
            zone: "tools".into(),
            tokens: tools_tokens,
            budget: None,
            truncated: false,
            items_dropped: 0,
        });
        reserved += tools_tokens;

        if reserved > input_budget {
            return Err(Error::config(format!(
                "system, environment, and tool definitions need {reserved} tokens \
                 but the input budget is {input_budget}"
            )));
        }
        let mut remaining = input_budget - reserved;

        // Injected zones, each under its own cap (further bounded by what
        // is actually left).
        for (zone, cap, section) in [
            (
                "skill",
                self.settings.skill_budget,
                render_skills(skills),
            ),
            (
                "knowledge",
                self.settings.knowledge_budget,
                render_snippets("## Retrieved knowledge", knowledge),
            ),
            (
                "memory",
                self.settings.memory_budget,
                render_snippets("## Recalled memory", memories),
            ),
        ] {
            let effective = cap.min(remaining);
            let (text, kept, dropped) = fit_items(&section, effective);
            let truncated = dropped > 0;
            if truncated {
                tracing::debug!(
                    zone,
                    kept,
                    dropped,
                    budget = effective,
                    "zone content truncated to fit budget"
                );
            }
            let tokens = if let Some(text) = text {
                let msg = Message::system(text);
                let tokens = estimate_message_tokens(&msg);
                messages.push(msg);
                tokens
            } else {
                0
            };
            remaining -= tokens.min(remaining);
            zones.push(ZoneUsage {
                zone: zone.into(),
                tokens,
                budget: Some(cap),
                truncated,
                items_dropped: dropped,
            });
        }

        // History last: compress into the remaining budget.
        let compressed = self
            .compress_history(conversation, remaining, summarizer)
            .await?;
        let history_tokens = estimate_messages_tokens(&conversation.messages);
        zones.push(ZoneUsage {
            zone: "history".into(),
            tokens: history_tokens,
            budget: Some(remaining),
            truncated: compressed > 0,
            items_dropped: compressed,
        });
        messages.extend(conversation.messages.iter().cloned());

        let total_tokens = estimate_messages_tokens(&messages) + tools_tokens;
        let report = ZoneReport {
            zones,
            total_tokens,
            input_budget,
        };
        tracing::debug!(
            total = total_tokens,
            budget = input_budget,
            utilization = format!("{:.1}%", report.utilization_pct()),
            "context assembled"
        );
        Ok(AssembledContext { messages, report })
    }

    /// Shrink the transcript until it fits `budget` tokens.
    ///
    /// Repeatedly summarizes the oldest half of the compressible region
    /// (everything before the verbatim floor) into one synthetic system
    /// message. A summarizer failure degrades to dropping the block with a
    /// stub marker instead. Returns the number of messages compressed away.
    async fn compress_history(
        &self,
        conversation: &mut Conversation,
        budget: usize,
        summarizer: &dyn Summarizer,
    ) -> Result<usize> {
        let floor = self.settings.history_floor;
        let mut compressed = 0usize;

        loop {
            let before = estimate_messages_tokens(&conversation.messages);
            if before <= budget || conversation.len() <= floor {
                break;
            }
            let compressible = conversation.len() - floor;
            let block = compressible.div_ceil(2);
            let summary = match summarizer.summarize(&conversation.messages[..block]).await {
                Ok(text) => Message::system(format!("[Earlier conversation, summarized]\n{text}")),
                Err(err) => {
                    tracing::warn!(error = %err, block, "summarizer failed, dropping oldest messages");
                    Message::system("[Earlier messages omitted]")
                }
            };
            conversation.replace_range(0..block, summary);
            compressed += block;

            // A one-message block swapped for a same-size summary makes no
            // progress; stop rather than spin.
            if estimate_messages_tokens(&conversation.messages) >= before {
                break;
            }
        }

        if estimate_messages_tokens(&conversation.messages) > budget {
            return Err(Error::config(format!(
                "history cannot be compressed below its budget ({budget} tokens) while keeping \
                 the {floor} most recent messages; raise context_window or lower history_floor"
            )));
        }
        Ok(compressed)
    }
}

/// Render skills as droppable items (header + one block per skill).
fn render_skills(skills: &[SkillPrompt]) -> Vec<String> {
    if skills.is_empty() {
        return Vec::new();
    }
    let mut items = vec!["## Active skills".to_string()];
    items.extend(
        skills
            .iter()
            .map(|s| format!("### {}\n{}", s.name, s.prompt_text)),
    );
    items
}

/// Render snippets as droppable items.
fn render_snippets(header: &str, snippets: &[Snippet]) -> Vec<String> {
    if snippets.is_empty() {
        return Vec::new();
    }
    let mut items = vec![header.to_string()];
    items.extend(
        snippets
            .iter()
            .map(|s| format!("- [{}] {}", s.source, s.text)),
    );
    items
}

/// Keep items front-to-back while they fit the budget; drop the rest.
/// Returns (joined text, items kept, items dropped) — the header does not
/// count as an item.
fn fit_items(items: &[String], budget: usize) -> (Option<String>, usize, usize) {
    if items.is_empty() {
        return (None, 0, 0);
    }
    let mut text = String::new();
    let mut kept = 0usize;
    for item in items {
        let candidate_len = if text.is_empty() {
            item.len()
        } else {
            text.len() + 1 + item.len()
        };
        if candidate_len.div_ceil(4) > budget {
            break;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(item);
        kept += 1;
    }
    // A lone header carries no content; treat it as nothing kept.
    if kept <= 1 {
        return (None, 0, items.len() - 1);
    }
    (Some(text), kept - 1, items.len() - kept)
}
