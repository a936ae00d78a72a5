pub mod config;
pub mod entity;
pub mod error;
pub mod streaming;
pub mod text;
pub mod traits;
pub mod types;

pub use config::*;
pub use entity::*;
pub use error::*;
pub use streaming::*;
pub use text::*;
pub use traits::*;
pub use types::*;
