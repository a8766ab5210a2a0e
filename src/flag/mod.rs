pub mod flag;
pub use flag::*;

pub mod flags;
pub use flags::*;
