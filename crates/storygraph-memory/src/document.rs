use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storygraph_core::{Result, StoryGraphError};
use storygraph_patch::{apply_text_instructions, FieldOp};

/// Placeholder content a fresh document starts with. While the document
/// still equals this sentinel it may only ever be replaced wholesale,
/// never diffed: diff instructions matching boilerplate would corrupt
/// the first real write.
pub const DEFAULT_TEMPLATE: &str = "\
# World Analysis

## General Synthesis

No analysis yet. Completed calls are reviewed here.

## Feature Notes

(no feature notes yet)

## Recent Feedback

(none)
";

/// The consolidated analysis document: a single versioned text blob with
/// named sections, mutated exclusively through patch-protocol field ops
/// so growth stays incremental and auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDocument {
    pub version: u64,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for FeedbackDocument {
    fn default() -> Self {
        Self {
            version: 0,
            content: DEFAULT_TEMPLATE.to_string(),
            updated_at: Utc::now(),
        }
    }
}

impl FeedbackDocument {
    pub fn is_default(&self) -> bool {
        self.content == DEFAULT_TEMPLATE
    }

    /// Apply one field op to the document-as-a-single-field. Returns the
    /// diagnostics for skipped diff instructions. Bumps the version only
    /// when the content actually changed.
    pub fn apply_op(&mut self, op: &FieldOp) -> Result<Vec<String>> {
        match op {
            FieldOp::Replace(value) => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => {
                        return Err(StoryGraphError::InvalidOperation(format!(
                            "document replace expects a string, got {}",
                            other
                        )))
                    }
                };
                self.commit(text);
                Ok(Vec::new())
            }
            FieldOp::TextDiff(instructions) => {
                if self.is_default() {
                    return Err(StoryGraphError::InvalidOperation(
                        "default template may only be replaced wholesale".to_string(),
                    ));
                }
                let (next, misses) = apply_text_instructions(&self.content, instructions);
                if next != self.content {
                    self.commit(next);
                }
                Ok(misses)
            }
        }
    }

    fn commit(&mut self, content: String) {
        self.content = content;
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
