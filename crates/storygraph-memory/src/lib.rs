pub mod document;
pub mod queue;

pub use document::{FeedbackDocument, DEFAULT_TEMPLATE};
pub use queue::{AnalysisTask, FeedbackMemory, TaskKind};
