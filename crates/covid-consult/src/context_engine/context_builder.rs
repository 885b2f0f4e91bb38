//! Turns retrieved documents into the context string handed to the
//! answer generator.

use tracing::debug;

use crate::vector_index::Document;

const SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltContext {
    pub text: String,
    pub documents_used: usize,
}

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    max_chars: usize,
}

impl ContextBuilder {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Join documents nearest first with a blank line between them. Only
    /// whole documents are added, and adding stops at the first one that
    /// would push the text past `max_chars`. The nearest document is always
    /// kept.
    pub fn build(&self, documents: &[Document]) -> BuiltContext {
        let mut text = String::new();
        let mut chars = 0;
        let mut used = 0;

        for document in documents {
            let doc_chars = document.text.chars().count();
            let extra = if used == 0 { doc_chars } else { doc_chars + SEPARATOR.len() };
            if used > 0 && chars + extra > self.max_chars {
                debug!(
                    "Context capped at {} of {} documents ({} chars)",
                    used,
                    documents.len(),
                    chars
                );
                break;
            }
            if used > 0 {
                text.push_str(SEPARATOR);
            }
            text.push_str(&document.text);
            chars += extra;
            used += 1;
        }

        BuiltContext { text, documents_used: used }
    }
}
