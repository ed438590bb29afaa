//! Order and CRM extraction from a WhatsApp group's message history.
//!
//! This library provides:
//! - A message gateway client with randomized pacing ([`source`], [`pacing`])
//! - A keyword pre-filter run before any paid LLM call ([`prefilter`])
//! - LLM-backed classification, formatting and CRM extraction stages, each
//!   under a bounded retry policy ([`classifier`], [`formatter`], [`crm`], [`retry`])
//! - Checkpointing of accepted orders so an interrupted run can resume ([`checkpoint`])
//! - Token and cost accounting for the metered LLM usage ([`ledger`])
//!
//! [`pipeline::Pipeline`] ties the stages together for one fetched batch.

pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod crm;
pub mod errors;
pub mod formatter;
pub mod ledger;
pub mod llm;
pub mod output;
pub mod pacing;
pub mod pipeline;
pub mod prefilter;
pub mod retry;
pub mod source;

pub use config::{HarvestConfig, PipelineProfile, ProfileKind};
pub use crm::{CrmRecord, CrmStats};
pub use errors::{HarvestError, RetryCategory};
pub use formatter::FormattedOrder;
pub use ledger::{CallKind, Pricing, TokenUsage, UsageLedger};
pub use llm::{AnthropicClient, LlmClient};
pub use pipeline::{BatchOutcome, Pipeline, RunStats};
pub use source::{MessageSource, RawMessage, UltraMsgSource};
