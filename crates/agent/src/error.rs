//! Error kinds raised out of `process_message` itself (§7 error table).
//!
//! Most error kinds in §7 are recovered in place (context overflow retry,
//! tool errors folded into a `tool_result`, fact-extraction/classifier
//! failures logged and dropped) and never reach this type. What's left is
//! the handful the caller must see: a missing session, or every configured
//! provider failing in the same turn.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("provider exhausted: {0}")]
    ProviderExhausted(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
