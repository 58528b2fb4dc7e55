//! Attachment → content-block conversion (§4.9 step 3). A real deployment
//! would hand image/audio bytes to a multimodal provider; that transport is
//! out of scope here (the spec names attachment processing as a step, not a
//! concrete media pipeline). What's implemented is the documented failure
//! contract: a conversion failure is logged and the turn continues
//! text-only — it never aborts the turn.

use tracing::warn;

use vesper_llm::ContentBlock;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Converts `attachments` into content blocks, dropping (and logging) any
/// that can't be represented as text.
pub fn process_attachments(attachments: &[Attachment]) -> Vec<ContentBlock> {
    attachments
        .iter()
        .filter_map(|attachment| match std::str::from_utf8(&attachment.data) {
            Ok(text) => Some(ContentBlock::Text { text: format!("[attachment: {} ({})]\n{text}", attachment.name, attachment.mime_type) }),
            Err(error) => {
                warn!(
                    component = "agent_loop",
                    operation = "process_attachments",
                    attachment = %attachment.name,
                    cause = %error,
                    "media processing failed, continuing text-only"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_attachment_becomes_text_block() {
        let attachments = vec![Attachment { name: "note.txt".to_string(), mime_type: "text/plain".to_string(), data: b"hello".to_vec() }];
        let blocks = process_attachments(&attachments);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn non_utf8_attachment_is_dropped_not_errored() {
        let attachments = vec![Attachment { name: "img.png".to_string(), mime_type: "image/png".to_string(), data: vec![0xff, 0xd8, 0xff, 0x00] }];
        let blocks = process_attachments(&attachments);
        assert!(blocks.is_empty());
    }
}
