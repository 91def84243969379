//! Encoded Dalvik method bodies
//!
//! This is the boundary format of the crate: what a method looks like before it is ballooned and
//! after it is synced. Only the slice of the Dalvik instruction set that the transformation engine
//! reasons about is modelled.

mod code;
mod code_item;
mod debug;
mod errors;
mod instruction;
mod opcode;

pub use code::*;
pub use code_item::*;
pub use debug::*;
pub use errors::*;
pub use instruction::*;
pub use opcode::*;
