//! Budget-aware context assembly.
//!
//! Every completion request is built from six zones in fixed precedence:
//! System and Environment (reserved, never truncated), Skill, Knowledge,
//! and Memory (capped, truncatable), and History (compressible down to a
//! verbatim floor of the most recent messages).

pub mod assembler;
pub mod token;

pub use assembler::{
    AssembledContext, CompletionSummarizer, ContextAssembler, Summarizer, ZoneReport, ZoneUsage,
};
