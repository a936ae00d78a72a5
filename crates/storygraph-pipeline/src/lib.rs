pub mod dispatch;
pub mod pipeline;
pub mod prompts;
pub mod session;
pub mod snapshot;
pub mod state;

pub use dispatch::CallDispatcher;
pub use pipeline::{GenerationPipeline, ProgressCallback};
pub use session::SessionContext;
pub use snapshot::SessionSnapshot;
pub use state::*;
