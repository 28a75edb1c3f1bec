//! # Taskloom Core
//!
//! Domain types, collaborator traits, and error definitions for the Taskloom
//! orchestration engine. This crate has **zero framework dependencies** — it
//! defines the domain model that the engine and every external collaborator
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (completion provider, tools, retrieval,
//! skill routing, persistence, human confirmation) is a trait here.
//! Implementations are injected explicitly at construction — no globals.
//! This keeps the dependency graph pointing inward and makes every seam
//! mockable in tests.

pub mod error;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod skill;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, PlanError, ProviderError, Result, ToolError};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use provider::{CompletionRequest, CompletionResponse, Provider, ToolDefinition, Usage};
pub use retrieval::{Retriever, Snippet};
pub use skill::{KeywordSkillRouter, SkillPrompt, SkillRouter};
pub use store::{ConversationStore, InMemoryStore};
pub use tool::{ConfirmationGate, ConfirmationRequest, Tool, ToolRegistry};
