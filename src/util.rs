mod bit_set;

pub use bit_set::*;
