use std::collections::BTreeMap;

/// Assembles the live transcript from push events.
///
/// Chunk texts are kept in an index-ordered set deduplicated by index; a
/// repeated index replaces the text rather than inserting. The locally
/// assembled join is a fallback: the server's last `content_update` payload
/// is authoritative whenever present, and the `all_complete` payload is
/// final.
#[derive(Debug, Default)]
pub struct TranscriptAssembly {
    chunks: BTreeMap<u64, String>,
    authoritative: Option<String>,
    complete: bool,
}

impl TranscriptAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `chunk_complete` event. Returns true if the index was new.
    pub fn apply_chunk(&mut self, index: u64, text: String) -> bool {
        self.chunks.insert(index, text).is_none()
    }

    /// Apply a `content_update` event (authoritative current transcript).
    /// Updates arriving after completion are discarded.
    pub fn apply_content_update(&mut self, content: String) {
        if self.complete {
            tracing::debug!("Ignoring content_update after completion");
            return;
        }
        self.authoritative = Some(content);
    }

    /// Apply the `all_complete` payload (final transcript).
    pub fn apply_complete(&mut self, content: String) {
        self.authoritative = Some(content);
        self.complete = true;
    }

    /// Current best transcript: authoritative server content when present,
    /// otherwise the in-order chunk join.
    pub fn current(&self) -> String {
        match &self.authoritative {
            Some(content) => content.clone(),
            None => self
                .chunks
                .values()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    /// Highest chunk index seen; the reconnect resume hint. Monotonic
    /// non-decreasing for the life of the assembly.
    pub fn last_index(&self) -> Option<u64> {
        self.chunks.keys().next_back().copied()
    }

    pub fn transcribed_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.authoritative = None;
        self.complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_assemble_in_index_order() {
        let mut assembly = TranscriptAssembly::new();
        assembly.apply_chunk(2, "third".to_string());
        assembly.apply_chunk(0, "first".to_string());
        assembly.apply_chunk(1, "second".to_string());

        assert_eq!(assembly.current(), "first\n\nsecond\n\nthird");
        assert_eq!(assembly.last_index(), Some(2));
        assert_eq!(assembly.transcribed_chunks(), 3);
    }

    #[test]
    fn test_duplicate_index_replaces_text() {
        let mut assembly = TranscriptAssembly::new();
        assert!(assembly.apply_chunk(0, "draft text".to_string()));
        assert!(!assembly.apply_chunk(0, "revised text".to_string()));

        assert_eq!(assembly.current(), "revised text");
        assert_eq!(assembly.transcribed_chunks(), 1);
    }

    #[test]
    fn test_repeat_chunk_is_idempotent() {
        let mut once = TranscriptAssembly::new();
        once.apply_chunk(0, "hello".to_string());
        once.apply_chunk(1, "world".to_string());

        let mut twice = TranscriptAssembly::new();
        twice.apply_chunk(0, "hello".to_string());
        twice.apply_chunk(1, "world".to_string());
        twice.apply_chunk(1, "world".to_string());

        assert_eq!(once.current(), twice.current());
        assert_eq!(once.last_index(), twice.last_index());
    }

    #[test]
    fn test_content_update_wins_over_local_assembly() {
        let mut assembly = TranscriptAssembly::new();
        assembly.apply_chunk(0, "helo wrld".to_string());
        assembly.apply_content_update("hello world".to_string());

        assert_eq!(assembly.current(), "hello world");
    }

    #[test]
    fn test_content_update_after_complete_is_ignored() {
        let mut assembly = TranscriptAssembly::new();
        assembly.apply_chunk(0, "hello".to_string());
        assembly.apply_complete("hello world.".to_string());
        assembly.apply_content_update("late straggler".to_string());

        assert!(assembly.is_complete());
        assert_eq!(assembly.current(), "hello world.");
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut assembly = TranscriptAssembly::new();
        assembly.apply_chunk(0, "hello".to_string());
        assembly.apply_complete("hello.".to_string());
        assembly.clear();

        assert_eq!(assembly.current(), "");
        assert!(assembly.last_index().is_none());
        assert!(!assembly.is_complete());
    }
}
