pub mod apply;
pub mod ops;
pub mod parse;

pub use apply::{apply_patch, apply_text_instructions};
pub use ops::*;
pub use parse::{parse_document_op, parse_field_op, parse_patch_payload};
