//! Progress events emitted mid-turn (§6 channel interface: `onProgress`).
//! The channel is free to render or ignore any of these.

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// The model is between tool rounds with no new text yet.
    Thinking,
    /// A cleaned (tool-call-JSON-stripped) slice of assistant text, emitted
    /// before tool dispatch so the channel can show partial progress.
    Status(String),
    ToolStart { name: String, args: String },
    ToolComplete { name: String, success: bool, output: String },
}
