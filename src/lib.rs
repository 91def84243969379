//! Transformation engine for Dalvik bytecode
//!
//! The [`dex`] module covers the encoded form of method bodies (instructions, try/catch tables,
//! the `code_item` container) while [`transform`] provides the editable form built from it, along
//! with control flow graphs, liveness and inlining.

pub mod dex;
pub mod transform;
pub mod util;
