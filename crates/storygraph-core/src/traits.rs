use crate::{ChatOptions, Message, Result, SearchResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Output of a completion request: either the full text at once or a
/// stream of chunks the caller must accumulate before parsing.
pub enum ChatOutput {
    Complete(String),
    Streamed(BoxStream<'static, Result<String>>),
}

impl fmt::Debug for ChatOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatOutput::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            ChatOutput::Streamed(_) => f.write_str("Streamed(..)"),
        }
    }
}

/// Abstract LLM completion capability. Concrete provider clients live
/// outside the core; errors must be classified as `Transport`,
/// `RateLimited`, or `MalformedResponse` for the dispatch boundary.
#[async_trait]
pub trait ChatCompletionProvider: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ChatOutput>;
}

/// Abstract web search capability. Advisory context only: the pipeline
/// tolerates partial and total failure of this provider.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn web_search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>>;
}

/// Abstract image synthesis, invoked only as a side effect of an
/// image-regeneration flag, never inline to a patch.
#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    /// Returns an opaque image reference.
    async fn request_image(&self, prompt: &str, seed: Option<u64>) -> Result<String>;
}

/// Opaque persistence of the session snapshot (entities + ledger +
/// feedback document) as a single serialize/deserialize boundary.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn persist(&self, blob: &[u8]) -> Result<()>;
    async fn load(&self) -> Result<Option<Vec<u8>>>;
}
