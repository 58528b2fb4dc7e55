//! The agent turn loop (C9) — the core orchestration module tying together
//! the LLM router (C2), memory store (C1/C5), context shaping and system
//! prompt assembly (C8), the fact extractor (C6), and the tool executor.

pub mod attachments;
pub mod convert;
pub mod cost_ledger;
pub mod error;
pub mod processor;
pub mod progress;
pub mod text_tool_calls;

pub use attachments::{process_attachments, Attachment};
pub use cost_ledger::MemoryCostLedger;
pub use error::AgentError;
pub use processor::{process_message, AgentDeps, ProcessMessageOutput, TokenUsage, TurnStopReason};
pub use progress::ProgressEvent;
