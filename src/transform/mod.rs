//! Editable IR over Dalvik method bodies
//!
//! A method is "ballooned" from its encoded [`crate::dex::DexCode`] into a [`FatMethod`], a linked
//! sequence of instructions interleaved with marker nodes (try boundaries, catch handlers, branch
//! targets and debug entries). Branch offsets and exception table addresses are replaced by links
//! between nodes, so code can be inserted and removed freely. "Syncing" relaxes instruction
//! encodings until everything fits and turns the sequence back into code.
//!
//! On top of that sit basic blocks, register liveness and method inlining.

mod balloon;
mod cfg;
pub mod fat_method;
mod inline;
mod liveness;
mod method_item;
mod method_transform;
mod registry;
mod sync;

pub use balloon::*;
pub use cfg::*;
pub use fat_method::{EntryId, FatMethod};
pub use inline::*;
pub use liveness::*;
pub use method_item::*;
pub use method_transform::*;
pub use registry::*;
pub use sync::*;
